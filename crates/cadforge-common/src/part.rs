use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::project::Complexity;
use crate::unit::ExportedFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ManufacturingMethod {
    #[default]
    #[serde(rename = "3d_print")]
    ThreeDPrint,
    #[serde(rename = "cnc")]
    Cnc,
}

impl ManufacturingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ThreeDPrint => "3d_print",
            Self::Cnc => "cnc",
        }
    }
}

impl fmt::Display for ManufacturingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ManufacturingMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "3d_print" | "3d-print" | "fdm" => Ok(Self::ThreeDPrint),
            "cnc" => Ok(Self::Cnc),
            _ => Err(format!("Invalid manufacturing method: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartStatus {
    #[default]
    Pending,
    Generating,
    Completed,
    Failed,
}

impl PartStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for PartStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Estimated bounding box in millimetres. Any axis may be unknown.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Dimensions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
}

impl Dimensions {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            z: Some(z),
        }
    }

    pub fn is_known(&self) -> bool {
        self.x.is_some() && self.y.is_some() && self.z.is_some()
    }
}

fn default_material() -> String {
    "PLA".to_string()
}

/// One manufacturable component of a decomposed design.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub part_number: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub manufacturing_method: ManufacturingMethod,
    #[serde(default = "default_material")]
    pub material: String,
    #[serde(default)]
    pub dimensions: Dimensions,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub status: PartStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_unit_id: Option<String>,
    #[serde(default)]
    pub files: Vec<ExportedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Part {
    pub fn new(part_number: u32, name: &str, description: &str) -> Self {
        Self {
            part_number,
            name: name.to_string(),
            description: description.to_string(),
            manufacturing_method: ManufacturingMethod::default(),
            material: default_material(),
            dimensions: Dimensions::default(),
            complexity: Complexity::default(),
            notes: None,
            status: PartStatus::Pending,
            current_unit_id: None,
            files: Vec::new(),
            error: None,
        }
    }

    /// Prompt text handed to the generator for this part alone.
    pub fn generation_prompt(&self) -> String {
        let mut prompt = self.description.trim().to_string();
        if prompt.is_empty() {
            prompt = self.name.clone();
        }
        if let Dimensions {
            x: Some(x),
            y: Some(y),
            z: Some(z),
        } = self.dimensions
        {
            prompt.push_str(&format!(
                "\nApproximate dimensions: {}mm x {}mm x {}mm",
                x, y, z
            ));
        }
        if !self.material.trim().is_empty() {
            prompt.push_str(&format!("\nMaterial: {}", self.material.trim()));
        }
        if let Some(notes) = self.notes.as_deref().filter(|n| !n.trim().is_empty()) {
            prompt.push_str(&format!("\nNotes: {}", notes.trim()));
        }
        prompt
    }
}

/// Stage-3 artifact: the ordered list of parts for one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartBreakdown {
    pub project_id: Uuid,
    pub revision: u32,
    pub parts: Vec<Part>,
    pub created_at: DateTime<Utc>,
}

impl PartBreakdown {
    /// Build a breakdown, renumbering parts densely as 1..=N in list order.
    pub fn new(project_id: Uuid, revision: u32, mut parts: Vec<Part>) -> Self {
        for (idx, part) in parts.iter_mut().enumerate() {
            part.part_number = idx as u32 + 1;
        }
        Self {
            project_id,
            revision,
            parts,
            created_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn part(&self, number: u32) -> Option<&Part> {
        self.parts.iter().find(|p| p.part_number == number)
    }

    pub fn part_mut(&mut self, number: u32) -> Option<&mut Part> {
        self.parts.iter_mut().find(|p| p.part_number == number)
    }

    pub fn is_dense(&self) -> bool {
        self.parts
            .iter()
            .enumerate()
            .all(|(idx, p)| p.part_number == idx as u32 + 1)
    }

    /// Number of parts per manufacturing method, 3D-printed first.
    pub fn count_by_method(&self) -> Vec<(ManufacturingMethod, usize)> {
        [ManufacturingMethod::ThreeDPrint, ManufacturingMethod::Cnc]
            .into_iter()
            .map(|method| {
                let count = self
                    .parts
                    .iter()
                    .filter(|p| p.manufacturing_method == method)
                    .count();
                (method, count)
            })
            .collect()
    }

    pub fn count_with_status(&self, status: PartStatus) -> usize {
        self.parts.iter().filter(|p| p.status == status).count()
    }
}
