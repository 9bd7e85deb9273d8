use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{EnumCount, EnumIter, IntoStaticStr};

/// The fixed label set, in model output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount, IntoStaticStr)]
pub enum WasteCategory {
    #[strum(serialize = "Chemical waste")]
    Chemical,
    #[strum(serialize = "Infectious Waste")]
    Infectious,
    #[strum(serialize = "Sharps")]
    Sharps,
    #[strum(serialize = "Pharmaceutical Waste")]
    Pharmaceutical,
    #[strum(serialize = "General Medical Waste")]
    GeneralMedical,
}

impl WasteCategory {
    /// Label used in classification results.
    pub fn label(&self) -> &'static str {
        (*self).into()
    }

    /// Name shown by the category listing. Only differs from `label` in casing
    /// for chemical waste.
    pub fn display_name(&self) -> &'static str {
        match self {
            WasteCategory::Chemical => "Chemical Waste",
            other => other.label(),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            WasteCategory::Chemical => {
                "Disinfectants, solvents, reagents, and other chemicals used in medical procedures."
            }
            WasteCategory::Infectious => {
                "Waste contaminated with blood and other bodily fluids, cultures and stocks of infectious agents."
            }
            WasteCategory::Sharps => {
                "Needles, syringes, scalpels, and other sharp objects that can cause cuts or puncture wounds."
            }
            WasteCategory::Pharmaceutical => "Unused, expired, or contaminated drugs and vaccines.",
            WasteCategory::GeneralMedical => {
                "Disposable medical supplies and materials that are not contaminated with infectious agents or bodily fluids."
            }
        }
    }

    pub fn info(&self) -> CategoryInfo {
        CategoryInfo {
            name: self.display_name().to_string(),
            description: self.description().to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Prediction {
    pub category: String,
    pub confidence: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ClassificationResponse {
    pub top_category: String,
    pub confidence: f64,
    pub all_predictions: Vec<Prediction>,
    pub timestamp: f64,
    pub filename: String,
    pub image_path: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HistoryEntry {
    pub timestamp: i64,
    pub filename: String,
    /// Base64 of the archived file bytes.
    pub image: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct HistoryResponse {
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CategoryInfo {
    pub name: String,
    pub description: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CategoriesResponse {
    pub categories: Vec<CategoryInfo>,
}

impl CategoriesResponse {
    pub fn all() -> Self {
        Self {
            categories: WasteCategory::iter().map(|c| c.info()).collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HealthResponse {
    pub status: String,
    pub model_loaded: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ErrorResponse {
    pub error: String,
}
