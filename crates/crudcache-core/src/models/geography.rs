use serde::{Deserialize, Serialize};

use super::Entity;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub id: String,
    pub name: String,
    /// Postal abbreviation, e.g. "TX"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewState {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl NewState {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: None,
        }
    }
}

impl Entity for State {
    type Draft = NewState;

    const KIND: &'static str = "state";
    const RESOURCE: &'static str = "states";

    fn id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    fn from_draft(id: String, draft: &NewState) -> Self {
        Self {
            id,
            name: draft.name.clone(),
            code: draft.code.clone(),
        }
    }

    fn draft_display_name(draft: &NewState) -> &str {
        &draft.name
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct City {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCity {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_id: Option<String>,
}

impl Entity for City {
    type Draft = NewCity;

    const KIND: &'static str = "city";
    const RESOURCE: &'static str = "cities";

    fn id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    fn from_draft(id: String, draft: &NewCity) -> Self {
        Self {
            id,
            name: draft.name.clone(),
            state_id: draft.state_id.clone(),
        }
    }

    fn draft_display_name(draft: &NewCity) -> &str {
        &draft.name
    }
}
