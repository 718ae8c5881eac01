//! Named-tensor plumbing around `ort::Session::run`.

use ndarray::{ArrayD, CowArray, IxDyn};
use ort::{Session, Value};

use super::ModelError;

/// An input tensor in one of the element types the exported graphs use.
#[derive(Debug, Clone)]
pub enum Tensor {
    F32(ArrayD<f32>),
    I64(ArrayD<i64>),
}

impl From<ArrayD<f32>> for Tensor {
    fn from(a: ArrayD<f32>) -> Self {
        Tensor::F32(a)
    }
}

impl From<ArrayD<i64>> for Tensor {
    fn from(a: ArrayD<i64>) -> Self {
        Tensor::I64(a)
    }
}

enum TensorView<'a> {
    F32(CowArray<'a, f32, IxDyn>),
    I64(CowArray<'a, i64, IxDyn>),
}

/// Outputs of one run, keyed by the graph's output names.
#[derive(Debug)]
pub struct Outputs(Vec<(String, ArrayD<f32>)>);

impl Outputs {
    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, a)| a)
    }

    pub fn take(&mut self, name: &str) -> Result<ArrayD<f32>, ModelError> {
        let index = self
            .0
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| ModelError::Output(format!("missing output {name}")))?;
        Ok(self.0.swap_remove(index).1)
    }

    pub fn into_vec(self) -> Vec<(String, ArrayD<f32>)> {
        self.0
    }
}

/// Feed `inputs` in the order the session declares them and collect every
/// output as `f32`.
pub fn run(session: &Session, inputs: &[(&str, &Tensor)]) -> Result<Outputs, ModelError> {
    let views = session
        .inputs
        .iter()
        .map(|declared| {
            let (_, tensor) = inputs
                .iter()
                .find(|(name, _)| *name == declared.name)
                .ok_or_else(|| ModelError::Output(format!("no value for model input {}", declared.name)))?;
            Ok(match tensor {
                Tensor::F32(a) => TensorView::F32(a.as_standard_layout()),
                Tensor::I64(a) => TensorView::I64(a.as_standard_layout()),
            })
        })
        .collect::<Result<Vec<_>, ModelError>>()?;

    let values = views
        .iter()
        .map(|view| match view {
            TensorView::F32(a) => Value::from_array(session.allocator(), a),
            TensorView::I64(a) => Value::from_array(session.allocator(), a),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let outputs = session.run(values)?;
    let mut named = Vec::with_capacity(outputs.len());
    for (declared, value) in session.outputs.iter().zip(outputs.iter()) {
        let array = value.try_extract::<f32>()?.view().to_owned();
        named.push((declared.name.clone(), array));
    }
    Ok(Outputs(named))
}

/// Fixed spatial size of a `(n, c, h, w)` input, if the graph pins one.
pub fn fixed_input_size(session: &Session, index: usize) -> Option<(usize, usize)> {
    let dims = &session.inputs.get(index)?.dimensions;
    match dims.as_slice() {
        [_, _, Some(h), Some(w)] => Some((*h as usize, *w as usize)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn take_removes_by_name() {
        let mut outputs = Outputs(vec![
            ("masks".into(), Array::zeros(IxDyn(&[1, 1, 2, 2]))),
            ("iou_predictions".into(), Array::from_elem(IxDyn(&[1, 1]), 0.7)),
        ]);
        assert!(outputs.get("masks").is_some());
        let iou = outputs.take("iou_predictions").unwrap();
        assert_eq!(iou[[0, 0]], 0.7);
        assert!(outputs.get("iou_predictions").is_none());
        assert!(matches!(outputs.take("iou_predictions"), Err(ModelError::Output(_))));
    }
}
