//! Query definitions and their validated form.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::filter::{Entity, PropertyFilter, PropertyFilterDef};

/// Reasons a query definition cannot become a tracker.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryValidationError {
    /// Query has no name.
    #[error("query name must not be empty")]
    EmptyName,
    /// Query lists no events.
    #[error("query '{0}' has no events")]
    NoEvents(String),
    /// An event entry has an empty name.
    #[error("query '{query}' has an empty event name at position {position}")]
    EmptyEventName { query: String, position: usize },
    /// Condition keyword is not one of the known ones.
    #[error("unknown events condition '{0}'")]
    UnknownCondition(String),
    /// Query type is not one of the known ones.
    #[error("unknown query type '{0}'")]
    UnknownQueryType(String),
    /// Filter or group-by entity is neither `event` nor `user`.
    #[error("unknown property entity '{0}'")]
    UnknownEntity(String),
    /// Filter property type is not supported.
    #[error("unknown property type '{0}'")]
    UnknownPropertyType(String),
    /// Operator is not valid for the filter's property type.
    #[error("operator '{operator}' is not valid for {property_type} properties")]
    UnknownOperator { property_type: String, operator: String },
    /// Logical operator is neither `AND` nor `OR`.
    #[error("unknown logical operator '{0}'")]
    UnknownLogicalOp(String),
    /// Filter value cannot be parsed for its property type.
    #[error("invalid value '{value}' for property '{property}': {reason}")]
    InvalidFilterValue {
        property: String,
        value: String,
        reason: String,
    },
}

/// How the events of a flat query combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventsCondition {
    /// One matching event completes the query.
    AnyGivenEvent,
    /// Every listed event must be seen.
    AllGivenEvent,
    /// Every match completes, counted against the matching event.
    EachGivenEvent,
}

impl EventsCondition {
    fn parse(raw: &str) -> Result<Self, QueryValidationError> {
        match raw {
            "any_given_event" => Ok(Self::AnyGivenEvent),
            "all_given_event" => Ok(Self::AllGivenEvent),
            "each_given_event" => Ok(Self::EachGivenEvent),
            other => Err(QueryValidationError::UnknownCondition(other.to_string())),
        }
    }
}

/// What a completion counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    /// Every completion, across and within users.
    EventsOccurrence,
    /// The first completion of each user.
    UniqueUsers,
}

impl QueryType {
    fn parse(raw: &str) -> Result<Self, QueryValidationError> {
        match raw {
            "events_occurrence" => Ok(Self::EventsOccurrence),
            "unique_users" => Ok(Self::UniqueUsers),
            other => Err(QueryValidationError::UnknownQueryType(other.to_string())),
        }
    }
}

/// Wire form of one queried event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryEventDef {
    #[serde(rename = "na")]
    pub name: String,
    #[serde(rename = "pr", default)]
    pub filters: Vec<PropertyFilterDef>,
}

/// Wire form of one group-by property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupByDef {
    #[serde(rename = "en")]
    pub entity: String,
    #[serde(rename = "pr")]
    pub property: String,
}

/// A query as received over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDefinition {
    pub name: String,
    #[serde(rename = "ty")]
    pub query_type: String,
    #[serde(rename = "ec")]
    pub condition: String,
    /// Match the events as ordered funnel steps instead of a flat set.
    #[serde(default)]
    pub sequential: bool,
    #[serde(rename = "ewp")]
    pub events: Vec<QueryEventDef>,
    #[serde(rename = "gbp", default)]
    pub group_by: Vec<GroupByDef>,
}

/// One event a step waits for, with its filters.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMatcher {
    pub(crate) name: String,
    pub(crate) filters: Vec<PropertyFilter>,
}

/// A group of matchers that must be satisfied together before the query
/// moves to its next step.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub(crate) matchers: Vec<EventMatcher>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupBy {
    pub(crate) entity: Entity,
    pub(crate) property: String,
}

/// A validated query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub name: String,
    pub query_type: QueryType,
    pub condition: EventsCondition,
    pub(crate) steps: Vec<Step>,
    pub(crate) group_by: Vec<GroupBy>,
}

impl Query {
    pub fn from_definition(def: &QueryDefinition) -> Result<Self, QueryValidationError> {
        if def.name.trim().is_empty() {
            return Err(QueryValidationError::EmptyName);
        }
        let query_type = QueryType::parse(&def.query_type)?;
        let condition = EventsCondition::parse(&def.condition)?;
        if def.events.is_empty() {
            return Err(QueryValidationError::NoEvents(def.name.clone()));
        }

        let mut matchers = Vec::with_capacity(def.events.len());
        for (position, event) in def.events.iter().enumerate() {
            if event.name.is_empty() {
                return Err(QueryValidationError::EmptyEventName {
                    query: def.name.clone(),
                    position,
                });
            }
            let filters = event
                .filters
                .iter()
                .map(PropertyFilter::from_def)
                .collect::<Result<Vec<_>, _>>()?;
            matchers.push(EventMatcher {
                name: event.name.clone(),
                filters,
            });
        }

        let steps = if def.sequential {
            matchers
                .into_iter()
                .map(|matcher| Step {
                    matchers: vec![matcher],
                })
                .collect()
        } else {
            vec![Step { matchers }]
        };

        let group_by = def
            .group_by
            .iter()
            .map(|group| {
                Ok(GroupBy {
                    entity: Entity::parse(&group.entity)?,
                    property: group.property.clone(),
                })
            })
            .collect::<Result<Vec<_>, QueryValidationError>>()?;

        Ok(Self {
            name: def.name.clone(),
            query_type,
            condition,
            steps,
            group_by,
        })
    }

    /// Event names in declaration order.
    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.steps
            .iter()
            .flat_map(|step| step.matchers.iter().map(|matcher| matcher.name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use serde_json::json;

    fn definition(value: serde_json::Value) -> QueryDefinition {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn sequential_queries_get_one_step_per_event() {
        let query = Query::from_definition(&definition(json!({
            "name": "signup funnel",
            "ty": "unique_users",
            "ec": "all_given_event",
            "sequential": true,
            "ewp": [{"na": "A"}, {"na": "B"}, {"na": "C"}]
        })))
        .unwrap();
        assert_eq!(query.steps.len(), 3);
        assert_eq!(query.event_names().collect::<Vec<_>>(), vec!["A", "B", "C"]);

        let flat = Query::from_definition(&definition(json!({
            "name": "any",
            "ty": "events_occurrence",
            "ec": "any_given_event",
            "ewp": [{"na": "A"}, {"na": "B"}]
        })))
        .unwrap();
        assert_eq!(flat.steps.len(), 1);
        assert_eq!(flat.steps[0].matchers.len(), 2);
    }

    #[test]
    fn validation_failures() {
        let base = json!({"name": "q", "ty": "unique_users", "ec": "any_given_event", "ewp": [{"na": "A"}]});
        let with = |key: &str, value: serde_json::Value| {
            let mut def = base.clone();
            def[key] = value;
            Query::from_definition(&definition(def)).unwrap_err()
        };
        assert_eq!(with("name", json!(" ")), QueryValidationError::EmptyName);
        assert_eq!(with("ewp", json!([])), QueryValidationError::NoEvents("q".to_string()));
        assert_eq!(
            with("ewp", json!([{"na": "A"}, {"na": ""}])),
            QueryValidationError::EmptyEventName {
                query: "q".to_string(),
                position: 1
            }
        );
        assert_eq!(
            with("ec", json!("some_given_event")),
            QueryValidationError::UnknownCondition("some_given_event".to_string())
        );
        assert_eq!(
            with("ty", json!("sessions")),
            QueryValidationError::UnknownQueryType("sessions".to_string())
        );
        assert_eq!(
            with("gbp", json!([{"en": "account", "pr": "$plan"}])),
            QueryValidationError::UnknownEntity("account".to_string())
        );
    }
}
