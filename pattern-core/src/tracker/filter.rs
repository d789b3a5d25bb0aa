//! Property filters evaluated against a record's event or user properties.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::query::QueryValidationError;

/// Placeholder value that stands for "property not set".
pub const NONE_VALUE: &str = "$none";

/// Wire form of one filter, as sent inside a query definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyFilterDef {
    /// `event` or `user`.
    #[serde(rename = "en")]
    pub entity: String,
    /// `categorical`, `numerical` or `datetime`.
    #[serde(rename = "ty")]
    pub property_type: String,
    #[serde(rename = "pr")]
    pub property: String,
    #[serde(rename = "op")]
    pub operator: String,
    #[serde(rename = "va")]
    pub value: String,
    /// `AND` or `OR`; ignored on the first filter of a list.
    #[serde(rename = "lop", default = "default_logical_op")]
    pub logical_op: String,
}

fn default_logical_op() -> String {
    "AND".to_string()
}

/// Which property bag a filter or group-by reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Event,
    User,
}

impl Entity {
    pub(crate) fn parse(raw: &str) -> Result<Self, QueryValidationError> {
        match raw {
            "event" => Ok(Self::Event),
            "user" => Ok(Self::User),
            other => Err(QueryValidationError::UnknownEntity(other.to_string())),
        }
    }

    pub(crate) const fn bag<'a>(
        self,
        event_properties: &'a Map<String, Value>,
        user_properties: &'a Map<String, Value>,
    ) -> &'a Map<String, Value> {
        match self {
            Self::Event => event_properties,
            Self::User => user_properties,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CategoricalOp {
    Equals,
    NotEqual,
    Contains,
    NotContains,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NumericOp {
    Equals,
    NotEqual,
    GreaterThan,
    LesserThan,
    GreaterThanOrEqual,
    LesserThanOrEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
struct DateRange {
    #[serde(rename = "fr")]
    from: i64,
    #[serde(rename = "to")]
    to: i64,
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Categorical { op: CategoricalOp, value: String },
    Numeric { op: NumericOp, value: f64 },
    DateRange { from: i64, to: i64 },
}

/// A validated filter.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyFilter {
    entity: Entity,
    property: String,
    condition: Condition,
    logical_op: LogicalOp,
}

impl PropertyFilter {
    pub fn from_def(def: &PropertyFilterDef) -> Result<Self, QueryValidationError> {
        let entity = Entity::parse(&def.entity)?;
        let logical_op = match def.logical_op.as_str() {
            "AND" | "" => LogicalOp::And,
            "OR" => LogicalOp::Or,
            other => return Err(QueryValidationError::UnknownLogicalOp(other.to_string())),
        };
        let unknown_operator = || QueryValidationError::UnknownOperator {
            property_type: def.property_type.clone(),
            operator: def.operator.clone(),
        };
        let invalid_value = |reason: String| QueryValidationError::InvalidFilterValue {
            property: def.property.clone(),
            value: def.value.clone(),
            reason,
        };

        let condition = match def.property_type.as_str() {
            "categorical" => {
                let op = match def.operator.as_str() {
                    "equals" => CategoricalOp::Equals,
                    "notEqual" => CategoricalOp::NotEqual,
                    "contains" => CategoricalOp::Contains,
                    "notContains" => CategoricalOp::NotContains,
                    _ => return Err(unknown_operator()),
                };
                Condition::Categorical {
                    op,
                    value: def.value.clone(),
                }
            }
            "numerical" => {
                let op = match def.operator.as_str() {
                    "equals" => NumericOp::Equals,
                    "notEqual" => NumericOp::NotEqual,
                    "greaterThan" => NumericOp::GreaterThan,
                    "lesserThan" => NumericOp::LesserThan,
                    "greaterThanOrEqual" => NumericOp::GreaterThanOrEqual,
                    "lesserThanOrEqual" => NumericOp::LesserThanOrEqual,
                    _ => return Err(unknown_operator()),
                };
                let value = def
                    .value
                    .trim()
                    .parse::<f64>()
                    .map_err(|err| invalid_value(err.to_string()))?;
                Condition::Numeric { op, value }
            }
            "datetime" => {
                if def.operator != "equals" {
                    return Err(unknown_operator());
                }
                let range: DateRange =
                    serde_json::from_str(&def.value).map_err(|err| invalid_value(err.to_string()))?;
                if range.from > range.to {
                    return Err(invalid_value("range starts after it ends".to_string()));
                }
                Condition::DateRange {
                    from: range.from,
                    to: range.to,
                }
            }
            other => return Err(QueryValidationError::UnknownPropertyType(other.to_string())),
        };

        Ok(Self {
            entity,
            property: def.property.clone(),
            condition,
            logical_op,
        })
    }

    fn matches(&self, event_properties: &Map<String, Value>, user_properties: &Map<String, Value>) -> bool {
        let value = self.entity.bag(event_properties, user_properties).get(&self.property);
        match &self.condition {
            Condition::Categorical { op, value: expected } => categorical(value, *op, expected),
            Condition::Numeric { op, value: expected } => value.and_then(as_f64).is_some_and(|actual| match op {
                NumericOp::Equals => (actual - expected).abs() < f64::EPSILON,
                NumericOp::NotEqual => (actual - expected).abs() >= f64::EPSILON,
                NumericOp::GreaterThan => actual > *expected,
                NumericOp::LesserThan => actual < *expected,
                NumericOp::GreaterThanOrEqual => actual >= *expected,
                NumericOp::LesserThanOrEqual => actual <= *expected,
            }),
            Condition::DateRange { from, to } => value
                .and_then(as_i64)
                .is_some_and(|actual| (*from..=*to).contains(&actual)),
        }
    }
}

/// Fold filters left to right by each filter's logical operator. An empty
/// list matches everything.
pub(crate) fn matches_all(
    filters: &[PropertyFilter],
    event_properties: &Map<String, Value>,
    user_properties: &Map<String, Value>,
) -> bool {
    let mut filters = filters.iter();
    let Some(first) = filters.next() else {
        return true;
    };
    filters.fold(first.matches(event_properties, user_properties), |so_far, filter| {
        match filter.logical_op {
            LogicalOp::And => so_far && filter.matches(event_properties, user_properties),
            LogicalOp::Or => so_far || filter.matches(event_properties, user_properties),
        }
    })
}

fn categorical(value: Option<&Value>, op: CategoricalOp, expected: &str) -> bool {
    let actual = value.and_then(property_string);
    if expected == NONE_VALUE {
        let absent = actual.as_deref().is_none_or(|actual| actual == NONE_VALUE);
        return match op {
            CategoricalOp::Equals | CategoricalOp::Contains => absent,
            CategoricalOp::NotEqual | CategoricalOp::NotContains => !absent,
        };
    }
    let actual = actual.unwrap_or_default();
    match op {
        CategoricalOp::Equals => actual.eq_ignore_ascii_case(expected),
        CategoricalOp::NotEqual => !actual.eq_ignore_ascii_case(expected),
        CategoricalOp::Contains => actual.to_lowercase().contains(&expected.to_lowercase()),
        CategoricalOp::NotContains => !actual.to_lowercase().contains(&expected.to_lowercase()),
    }
}

/// String form of a property; `null` counts as absent.
pub(crate) fn property_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use serde_json::json;

    fn def(entity: &str, ty: &str, property: &str, op: &str, value: &str, lop: &str) -> PropertyFilterDef {
        PropertyFilterDef {
            entity: entity.to_string(),
            property_type: ty.to_string(),
            property: property.to_string(),
            operator: op.to_string(),
            value: value.to_string(),
            logical_op: lop.to_string(),
        }
    }

    fn filter(entity: &str, ty: &str, property: &str, op: &str, value: &str) -> PropertyFilter {
        PropertyFilter::from_def(&def(entity, ty, property, op, value, "AND")).unwrap()
    }

    fn bag(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn categorical_comparisons_ignore_case() {
        let events = bag(json!({"$country": "India", "$page": "/Pricing/Plans"}));
        let users = Map::new();
        assert!(filter("event", "categorical", "$country", "equals", "india").matches(&events, &users));
        assert!(filter("event", "categorical", "$country", "notEqual", "us").matches(&events, &users));
        assert!(filter("event", "categorical", "$page", "contains", "pricing").matches(&events, &users));
        assert!(!filter("event", "categorical", "$page", "notContains", "PLANS").matches(&events, &users));
    }

    #[test]
    fn none_matches_missing_properties() {
        let events = bag(json!({"$set": "x", "$empty": null}));
        let users = Map::new();
        assert!(filter("event", "categorical", "$missing", "equals", NONE_VALUE).matches(&events, &users));
        assert!(filter("event", "categorical", "$empty", "equals", NONE_VALUE).matches(&events, &users));
        assert!(!filter("event", "categorical", "$set", "equals", NONE_VALUE).matches(&events, &users));
        assert!(filter("event", "categorical", "$set", "notEqual", NONE_VALUE).matches(&events, &users));
        assert!(!filter("event", "categorical", "$missing", "notContains", NONE_VALUE).matches(&events, &users));
    }

    #[test]
    fn numeric_comparisons_accept_numbers_and_numeric_strings() {
        let users = bag(json!({"$age": 30, "$score": "12.5", "$name": "bob"}));
        let events = Map::new();
        assert!(filter("user", "numerical", "$age", "greaterThan", "18").matches(&events, &users));
        assert!(filter("user", "numerical", "$age", "lesserThanOrEqual", "30").matches(&events, &users));
        assert!(filter("user", "numerical", "$score", "equals", "12.5").matches(&events, &users));
        assert!(!filter("user", "numerical", "$name", "notEqual", "1").matches(&events, &users));
        assert!(!filter("user", "numerical", "$missing", "lesserThan", "1").matches(&events, &users));
    }

    #[test]
    fn datetime_range_is_inclusive() {
        let events = bag(json!({"$ts": 100, "$late": "201"}));
        let users = Map::new();
        let range = r#"{"fr":100,"to":200}"#;
        assert!(filter("event", "datetime", "$ts", "equals", range).matches(&events, &users));
        assert!(!filter("event", "datetime", "$late", "equals", range).matches(&events, &users));
    }

    #[test]
    fn filters_fold_left_to_right() {
        let events = bag(json!({"$country": "us"}));
        let users = bag(json!({"$plan": "free"}));
        let filters = vec![
            PropertyFilter::from_def(&def("event", "categorical", "$country", "equals", "india", "AND")).unwrap(),
            PropertyFilter::from_def(&def("event", "categorical", "$country", "equals", "us", "OR")).unwrap(),
            PropertyFilter::from_def(&def("user", "categorical", "$plan", "equals", "paid", "AND")).unwrap(),
        ];
        assert!(!matches_all(&filters, &events, &users));
        assert!(matches_all(&filters[..2], &events, &users));
        assert!(matches_all(&[], &events, &users));
    }

    #[test]
    fn invalid_definitions_are_rejected() {
        assert!(matches!(
            PropertyFilter::from_def(&def("session", "categorical", "p", "equals", "x", "AND")),
            Err(QueryValidationError::UnknownEntity(_))
        ));
        assert!(matches!(
            PropertyFilter::from_def(&def("event", "categorical", "p", "greaterThan", "x", "AND")),
            Err(QueryValidationError::UnknownOperator { .. })
        ));
        assert!(matches!(
            PropertyFilter::from_def(&def("event", "numerical", "p", "equals", "ten", "AND")),
            Err(QueryValidationError::InvalidFilterValue { .. })
        ));
        assert!(matches!(
            PropertyFilter::from_def(&def("event", "datetime", "p", "equals", r#"{"fr":5,"to":1}"#, "AND")),
            Err(QueryValidationError::InvalidFilterValue { .. })
        ));
        assert!(matches!(
            PropertyFilter::from_def(&def("event", "boolean", "p", "equals", "x", "AND")),
            Err(QueryValidationError::UnknownPropertyType(_))
        ));
        assert!(matches!(
            PropertyFilter::from_def(&def("event", "categorical", "p", "equals", "x", "XOR")),
            Err(QueryValidationError::UnknownLogicalOp(_))
        ));
    }
}
