use serde::{Deserialize, Serialize};

use super::Entity;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Skill {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSkill {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Entity for Skill {
    type Draft = NewSkill;

    const KIND: &'static str = "skill";
    const RESOURCE: &'static str = "skills";

    fn id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    fn from_draft(id: String, draft: &NewSkill) -> Self {
        Self {
            id,
            name: draft.name.clone(),
            description: draft.description.clone(),
        }
    }

    fn draft_display_name(draft: &NewSkill) -> &str {
        &draft.name
    }
}

/// A named work shift. Times are "HH:MM" strings as the backend sends them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shift {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewShift {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
}

impl Shift {
    /// Format the shift window, e.g. "08:00-16:00"
    pub fn window_display(&self) -> String {
        match (&self.start_time, &self.end_time) {
            (Some(start), Some(end)) => format!("{}-{}", start, end),
            (Some(start), None) => format!("from {}", start),
            (None, Some(end)) => format!("until {}", end),
            (None, None) => "Unscheduled".to_string(),
        }
    }
}

impl Entity for Shift {
    type Draft = NewShift;

    const KIND: &'static str = "shift";
    const RESOURCE: &'static str = "shifts";

    fn id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    fn from_draft(id: String, draft: &NewShift) -> Self {
        Self {
            id,
            name: draft.name.clone(),
            start_time: draft.start_time.clone(),
            end_time: draft.end_time.clone(),
        }
    }

    fn draft_display_name(draft: &NewShift) -> &str {
        &draft.name
    }
}
