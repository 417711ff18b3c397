//! Two-stage composition: an agent proposes key points, a handler fills in
//! the full future.

use candle_core::{Result, Tensor};

use traj_common::InputType;

use crate::model::{ModelOutput, TrajModel};

pub struct SilverballersModel {
    agent: Box<dyn TrajModel>,
    handler: Box<dyn TrajModel>,
    name: String,
    /// Union of agent and handler inputs, first-seen order.
    input_types: Vec<InputType>,
    agent_index: Vec<usize>,
    handler_index: Vec<usize>,
}

impl SilverballersModel {
    pub fn new(agent: Box<dyn TrajModel>, handler: Box<dyn TrajModel>) -> Self {
        let mut input_types: Vec<InputType> = Vec::new();
        for t in agent.input_types().iter().chain(handler.input_types()) {
            if !input_types.contains(t) {
                input_types.push(*t);
            }
        }
        let index_of = |types: &[InputType]| -> Vec<usize> {
            types
                .iter()
                .filter_map(|t| input_types.iter().position(|u| u == t))
                .collect()
        };
        let agent_index = index_of(agent.input_types());
        let handler_index = index_of(handler.input_types());
        let name = format!("{}+{}", agent.name(), handler.name());
        Self {
            agent,
            handler,
            name,
            input_types,
            agent_index,
            handler_index,
        }
    }

    pub fn agent(&self) -> &dyn TrajModel {
        self.agent.as_ref()
    }
}

impl TrajModel for SilverballersModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_types(&self) -> &[InputType] {
        &self.input_types
    }

    /// Prediction is the handler's output; `aux[0]` holds the proposals.
    fn forward(&self, inputs: &[Tensor], training: bool) -> Result<ModelOutput> {
        let pick = |index: &[usize]| -> Result<Vec<Tensor>> {
            index
                .iter()
                .map(|&i| {
                    inputs.get(i).cloned().ok_or_else(|| {
                        candle_core::Error::Msg(format!(
                            "{}: expected {} inputs, got {}",
                            self.name,
                            self.input_types.len(),
                            inputs.len()
                        ))
                    })
                })
                .collect()
        };

        let proposals = self.agent.forward(&pick(&self.agent_index)?, training)?.prediction;
        let mut handler_inputs = pick(&self.handler_index)?;
        handler_inputs.push(proposals.clone());
        let out = self.handler.forward(&handler_inputs, training)?;
        Ok(ModelOutput {
            prediction: out.prediction,
            aux: vec![proposals],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    /// Returns a fixed tensor and records nothing; inputs are checked by shape.
    struct Fixed {
        name: &'static str,
        types: Vec<InputType>,
        expect_inputs: usize,
    }

    impl TrajModel for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn input_types(&self) -> &[InputType] {
            &self.types
        }

        fn forward(&self, inputs: &[Tensor], _training: bool) -> Result<ModelOutput> {
            assert_eq!(inputs.len(), self.expect_inputs);
            // sum of first elements identifies which inputs arrived
            let s: f32 = inputs
                .iter()
                .map(|t| t.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0])
                .sum();
            Ok(ModelOutput::new(Tensor::new(&[s], &Device::Cpu)?))
        }
    }

    #[test]
    fn union_of_inputs_in_first_seen_order() {
        let agent = Fixed {
            name: "agent",
            types: vec![InputType::Obs, InputType::Neighbor],
            expect_inputs: 2,
        };
        let handler = Fixed {
            name: "handler",
            types: vec![InputType::Map, InputType::Obs],
            // declared inputs plus the proposals
            expect_inputs: 3,
        };
        let model = SilverballersModel::new(Box::new(agent), Box::new(handler));
        assert_eq!(
            model.input_types(),
            &[InputType::Obs, InputType::Neighbor, InputType::Map]
        );
        assert_eq!(model.name(), "agent+handler");

        let inputs: Vec<Tensor> = [1.0f32, 10.0, 100.0]
            .iter()
            .map(|v| Tensor::new(&[*v], &Device::Cpu).unwrap())
            .collect();
        let out = model.forward(&inputs, false).unwrap();
        // agent saw obs + nei = 11; handler saw map + obs + proposals = 112
        assert_eq!(out.aux[0].to_vec1::<f32>().unwrap(), vec![11.0]);
        assert_eq!(out.prediction.to_vec1::<f32>().unwrap(), vec![112.0]);
    }
}
