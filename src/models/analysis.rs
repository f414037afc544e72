use serde::{Deserialize, Serialize};

/// Output of a completed analysis job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Input image with detected regions drawn on, base64-encoded.
    #[serde(default)]
    pub annotated_image_base64: String,
    #[serde(default)]
    pub components: Vec<DetectedComponent>,
}

/// One garment region found in the image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedComponent {
    pub name: String,
    #[serde(default)]
    pub dominant_color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bg_removed_url: Option<String>,
    #[serde(default)]
    pub clothing_items: Vec<ClothingItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub similar_queries: Vec<String>,
}

/// A shopping match for a detected component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClothingItem {
    pub title: String,
    #[serde(default)]
    pub thumbnail: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub link: String,
}

impl AnalysisResult {
    /// Total number of similar items across all components.
    pub fn item_count(&self) -> usize {
        self.components.iter().map(|c| c.clothing_items.len()).sum()
    }
}
