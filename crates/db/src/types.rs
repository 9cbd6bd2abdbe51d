use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Row-level change kind, using the single-letter wire encoding.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    EnumString,
    Display,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum Operation {
    #[sea_orm(string_value = "I")]
    #[serde(rename = "I")]
    #[strum(serialize = "I")]
    Insert,
    #[sea_orm(string_value = "U")]
    #[serde(rename = "U")]
    #[strum(serialize = "U")]
    Update,
    #[sea_orm(string_value = "D")]
    #[serde(rename = "D")]
    #[strum(serialize = "D")]
    Delete,
}

/// Outbox row lifecycle. `Applied` and `Failed` are terminal.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    Default,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EventStatus {
    #[default]
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "dispatched")]
    Dispatched,
    #[sea_orm(string_value = "applied")]
    Applied,
    #[sea_orm(string_value = "retry")]
    Retry,
    #[sea_orm(string_value = "failed")]
    Failed,
}

/// Fan-out row lifecycle. `Sent` and `Failed` are terminal.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    Default,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DestinationStatus {
    #[default]
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "sent")]
    Sent,
    #[sea_orm(string_value = "retry")]
    Retry,
    #[sea_orm(string_value = "failed")]
    Failed,
}

/// Origin tag written by capture triggers for locally captured changes.
pub const TRIGGER_ORIGIN: &str = "TRIGGER";

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn operation_uses_wire_letters() {
        assert_eq!(Operation::Insert.to_string(), "I");
        assert_eq!(Operation::from_str("D").unwrap(), Operation::Delete);
        assert_eq!(serde_json::to_string(&Operation::Update).unwrap(), "\"U\"");
    }

    #[test]
    fn statuses_round_trip_through_strings() {
        assert_eq!(EventStatus::Dispatched.to_string(), "dispatched");
        assert_eq!(
            DestinationStatus::from_str("retry").unwrap(),
            DestinationStatus::Retry
        );
    }
}
