//! Prompt parsing and normalization.
//!
//! The plugin sends a flat list of `{type, data}` prompts. Models want the
//! same information grouped per kind, so the list is folded into a
//! [`NormalizedPromptSet`] before any coordinate work happens.

use serde::{Deserialize, Serialize};

/// A prompt exactly as it arrives on the wire.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawPrompt {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub data: RawPromptData,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawPromptData {
    #[serde(default)]
    pub points: Vec<[f64; 2]>,
    #[serde(default)]
    pub labels: Vec<i64>,
    #[serde(default)]
    pub boxes: Vec<[f64; 4]>,
    #[serde(default)]
    pub text: Vec<String>,
}

/// One user-drawn hint.
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    Point { points: Vec<[f64; 2]>, labels: Vec<i64> },
    Box { boxes: Vec<[f64; 4]> },
    Text { text: Vec<String> },
}

impl Prompt {
    /// Unknown prompt types yield `None` and are skipped.
    pub fn from_raw(raw: RawPrompt) -> Option<Self> {
        let RawPrompt { kind, data } = raw;
        match kind.as_str() {
            "Point" => Some(Prompt::Point {
                points: data.points,
                labels: data.labels,
            }),
            "Box" => Some(Prompt::Box { boxes: data.boxes }),
            "Text" => Some(Prompt::Text { text: data.text }),
            other => {
                tracing::debug!(kind = other, "ignoring prompt of unknown type");
                None
            }
        }
    }
}

/// Point prompts grouped by object.
///
/// A batch holding exactly one object is kept in its unwrapped
/// [`PointBatch::Single`] form; single-object decoder calls expect it.
#[derive(Debug, Clone, PartialEq)]
pub enum PointBatch {
    Single(Vec<[f64; 2]>),
    Objects(Vec<Vec<[f64; 2]>>),
}

impl Default for PointBatch {
    fn default() -> Self {
        PointBatch::Objects(Vec::new())
    }
}

impl PointBatch {
    fn from_objects(mut objects: Vec<Vec<[f64; 2]>>) -> Self {
        if objects.len() == 1 {
            PointBatch::Single(objects.remove(0))
        } else {
            PointBatch::Objects(objects)
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            PointBatch::Single(_) => false,
            PointBatch::Objects(objects) => objects.is_empty(),
        }
    }

    pub fn object_count(&self) -> usize {
        match self {
            PointBatch::Single(_) => 1,
            PointBatch::Objects(objects) => objects.len(),
        }
    }

    /// Per-object point lists, in prompt order.
    pub fn objects(&self) -> Vec<&[[f64; 2]]> {
        match self {
            PointBatch::Single(points) => vec![points.as_slice()],
            PointBatch::Objects(objects) => objects.iter().map(Vec::as_slice).collect(),
        }
    }

    /// Apply `f` to every point, keeping the grouping.
    pub fn map_points(&self, mut f: impl FnMut([f64; 2]) -> [f64; 2]) -> Self {
        match self {
            PointBatch::Single(points) => {
                PointBatch::Single(points.iter().map(|p| f(*p)).collect())
            }
            PointBatch::Objects(objects) => PointBatch::Objects(
                objects
                    .iter()
                    .map(|points| points.iter().map(|p| f(*p)).collect())
                    .collect(),
            ),
        }
    }
}

/// Prompts of one request folded into per-kind sequences.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedPromptSet {
    pub points: PointBatch,
    /// Labels of every point across all objects, flattened in order.
    pub labels: Vec<i64>,
    pub boxes: Vec<[f64; 4]>,
    pub text: Vec<String>,
}

impl NormalizedPromptSet {
    pub fn is_empty(&self) -> bool {
        self.points.is_empty() && self.boxes.is_empty() && self.text.is_empty()
    }
}

/// Fold an ordered prompt list into a [`NormalizedPromptSet`].
///
/// Each `Point` prompt becomes one object. Label counts are not checked
/// here; the model adapter rejects a mismatch.
pub fn normalize(prompts: impl IntoIterator<Item = Prompt>) -> NormalizedPromptSet {
    let mut objects = Vec::new();
    let mut set = NormalizedPromptSet::default();

    for prompt in prompts {
        match prompt {
            Prompt::Point { points, labels } => {
                objects.push(points);
                set.labels.extend(labels);
            }
            Prompt::Box { boxes } => set.boxes.extend(boxes),
            Prompt::Text { text } => set.text.extend(text),
        }
    }

    set.points = PointBatch::from_objects(objects);
    set
}

/// Parse raw prompts, dropping unknown kinds, then normalize.
pub fn normalize_raw(raw: Vec<RawPrompt>) -> NormalizedPromptSet {
    normalize(raw.into_iter().filter_map(Prompt::from_raw))
}
