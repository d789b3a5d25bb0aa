//! Streaming query tracker.
//!
//! Records arrive grouped by user and sorted by timestamp within a user. Each
//! [`QueryTracker`] walks its query's steps as matching records arrive and
//! counts completions. Trackers keep no locks; scan independent inputs with
//! independent [`TrackerSet`]s.

pub mod filter;
mod query;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

pub use filter::{Entity, NONE_VALUE, PropertyFilter, PropertyFilterDef};
pub use query::{
    EventsCondition, GroupByDef, Query, QueryDefinition, QueryEventDef, QueryType, QueryValidationError,
};

use query::EventMatcher;

/// One user event as fed to the trackers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "uid", default)]
    pub user_id: String,
    #[serde(rename = "en", default)]
    pub event_name: String,
    /// Unix seconds.
    #[serde(rename = "et", default)]
    pub timestamp: i64,
    #[serde(rename = "epr", default)]
    pub event_properties: Map<String, Value>,
    #[serde(rename = "upr", default)]
    pub user_properties: Map<String, Value>,
}

impl EventRecord {
    pub fn new(user_id: impl Into<String>, event_name: impl Into<String>, timestamp: i64) -> Self {
        Self {
            user_id: user_id.into(),
            event_name: event_name.into(),
            timestamp,
            ..Self::default()
        }
    }

    /// Checks the fields every tracker relies on.
    pub fn validate(&self) -> Result<(), TrackerDataError> {
        if self.user_id.is_empty() {
            return Err(TrackerDataError::MissingUserId);
        }
        if self.event_name.is_empty() {
            return Err(TrackerDataError::MissingEventName {
                user_id: self.user_id.clone(),
            });
        }
        if self.timestamp < 0 {
            return Err(TrackerDataError::NegativeTimestamp {
                user_id: self.user_id.clone(),
                timestamp: self.timestamp,
            });
        }
        Ok(())
    }
}

/// A record that cannot be applied. Local to the record; the scan goes on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerDataError {
    #[error("record has no user id")]
    MissingUserId,
    #[error("record of user {user_id} has no event name")]
    MissingEventName { user_id: String },
    #[error("record of user {user_id} has negative timestamp {timestamp}")]
    NegativeTimestamp { user_id: String, timestamp: i64 },
    /// Timestamp earlier than the previous record of the same user.
    #[error("record of user {user_id} at {timestamp} arrived after {previous}")]
    OutOfOrder {
        user_id: String,
        timestamp: i64,
        previous: i64,
    },
}

/// Completions attributed to one queried event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventCount {
    pub event: String,
    pub count: u64,
}

/// Completions whose group-by properties had these values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupCount {
    pub values: Vec<String>,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub name: String,
    #[serde(rename = "queryType")]
    pub query_type: QueryType,
    pub count: u64,
    /// Per-event counts of `each_given_event` queries.
    #[serde(rename = "perEvent", skip_serializing_if = "Vec::is_empty")]
    pub per_event: Vec<EventCount>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupCount>,
}

impl EventMatcher {
    fn matches(&self, record: &EventRecord) -> bool {
        self.name == record.event_name
            && filter::matches_all(&self.filters, &record.event_properties, &record.user_properties)
    }
}

/// Step state of one query over the record stream.
#[derive(Debug)]
pub struct QueryTracker {
    query: Query,
    /// Position of the first matcher of every step in declaration order.
    offsets: Vec<usize>,
    current_user: Option<String>,
    last_timestamp: Option<i64>,
    wait: usize,
    found: Vec<bool>,
    user_counted: bool,
    event_counted: Vec<bool>,
    count: u64,
    per_event: Vec<u64>,
    groups: BTreeMap<Vec<String>, u64>,
}

impl QueryTracker {
    pub fn new(definition: &QueryDefinition) -> Result<Self, QueryValidationError> {
        Ok(Self::from_query(Query::from_definition(definition)?))
    }

    #[must_use]
    pub fn from_query(query: Query) -> Self {
        let mut offsets = Vec::with_capacity(query.steps.len());
        let mut total = 0;
        for step in &query.steps {
            offsets.push(total);
            total += step.matchers.len();
        }
        let first_step = query.steps.first().map_or(0, |step| step.matchers.len());
        Self {
            query,
            offsets,
            current_user: None,
            last_timestamp: None,
            wait: 0,
            found: vec![false; first_step],
            user_counted: false,
            event_counted: vec![false; total],
            count: 0,
            per_event: vec![0; total],
            groups: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn query(&self) -> &Query {
        &self.query
    }

    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// Index of the step the tracker is waiting on.
    #[must_use]
    pub const fn waiting_on(&self) -> usize {
        self.wait
    }

    /// Feed one record. Returns whether it completed the query.
    pub fn process(&mut self, record: &EventRecord) -> Result<bool, TrackerDataError> {
        record.validate()?;
        if self.current_user.as_deref() != Some(record.user_id.as_str()) {
            self.start_user(&record.user_id);
        }
        if let Some(previous) = self.last_timestamp
            && record.timestamp < previous
        {
            return Err(TrackerDataError::OutOfOrder {
                user_id: record.user_id.clone(),
                timestamp: record.timestamp,
                previous,
            });
        }
        self.last_timestamp = Some(record.timestamp);
        Ok(self.advance(record))
    }

    fn start_user(&mut self, user_id: &str) {
        self.current_user = Some(user_id.to_string());
        self.last_timestamp = None;
        if self.query.query_type == QueryType::UniqueUsers {
            self.reset_steps();
            self.user_counted = false;
            self.event_counted.fill(false);
        }
    }

    fn reset_steps(&mut self) {
        self.enter_step(0);
    }

    fn enter_step(&mut self, step: usize) {
        self.wait = step;
        let width = self.query.steps.get(step).map_or(0, |step| step.matchers.len());
        self.found.clear();
        self.found.resize(width, false);
    }

    fn advance(&mut self, record: &EventRecord) -> bool {
        let Some(step) = self.query.steps.get(self.wait) else {
            self.reset_steps();
            return false;
        };
        let matched: Vec<usize> = step
            .matchers
            .iter()
            .enumerate()
            .filter(|(_, matcher)| matcher.matches(record))
            .map(|(idx, _)| idx)
            .collect();
        if matched.is_empty() {
            return false;
        }

        let step_done = match self.query.condition {
            EventsCondition::AnyGivenEvent | EventsCondition::EachGivenEvent => true,
            EventsCondition::AllGivenEvent => {
                for idx in &matched {
                    self.found[*idx] = true;
                }
                self.found.iter().all(|seen| *seen)
            }
        };
        if !step_done {
            return false;
        }

        let offset = self.offsets[self.wait];
        if self.wait + 1 < self.query.steps.len() {
            self.enter_step(self.wait + 1);
            return false;
        }
        let positions: Vec<usize> = matched.iter().map(|idx| offset + idx).collect();
        self.complete(record, &positions);
        self.reset_steps();
        true
    }

    fn complete(&mut self, record: &EventRecord, positions: &[usize]) {
        let each = self.query.condition == EventsCondition::EachGivenEvent;
        match self.query.query_type {
            QueryType::EventsOccurrence => {
                self.count += 1;
                self.record_group(record);
                if each {
                    for position in positions {
                        self.per_event[*position] += 1;
                    }
                }
            }
            QueryType::UniqueUsers => {
                if !self.user_counted {
                    self.user_counted = true;
                    self.count += 1;
                    self.record_group(record);
                }
                if each {
                    for position in positions {
                        if !self.event_counted[*position] {
                            self.event_counted[*position] = true;
                            self.per_event[*position] += 1;
                        }
                    }
                }
            }
        }
        debug!(query = %self.query.name, user_id = %record.user_id, count = self.count, "query completed");
    }

    fn record_group(&mut self, record: &EventRecord) {
        if self.query.group_by.is_empty() {
            return;
        }
        let key = self
            .query
            .group_by
            .iter()
            .map(|group| {
                group
                    .entity
                    .bag(&record.event_properties, &record.user_properties)
                    .get(&group.property)
                    .and_then(filter::property_string)
                    .unwrap_or_else(|| NONE_VALUE.to_string())
            })
            .collect();
        *self.groups.entry(key).or_default() += 1;
    }

    #[must_use]
    pub fn result(&self) -> QueryResult {
        let per_event = if self.query.condition == EventsCondition::EachGivenEvent {
            self.query
                .event_names()
                .zip(&self.per_event)
                .map(|(event, count)| EventCount {
                    event: event.to_string(),
                    count: *count,
                })
                .collect()
        } else {
            Vec::new()
        };
        QueryResult {
            name: self.query.name.clone(),
            query_type: self.query.query_type,
            count: self.count,
            per_event,
            groups: self
                .groups
                .iter()
                .map(|(values, count)| GroupCount {
                    values: values.clone(),
                    count: *count,
                })
                .collect(),
        }
    }
}

/// Outcome of a scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanReport {
    pub results: Vec<QueryResult>,
    pub processed: u64,
    /// Records skipped because they were malformed or out of order.
    pub rejected: u64,
}

/// Trackers for several queries fed from the same record stream.
#[derive(Debug, Default)]
pub struct TrackerSet {
    trackers: Vec<QueryTracker>,
    processed: u64,
    rejected: u64,
}

impl TrackerSet {
    /// Validates every definition; any invalid query fails the whole set.
    pub fn new<'a>(definitions: impl IntoIterator<Item = &'a QueryDefinition>) -> Result<Self, QueryValidationError> {
        let trackers = definitions
            .into_iter()
            .map(QueryTracker::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            trackers,
            ..Self::default()
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    /// Feed one record to every tracker.
    pub fn process(&mut self, record: &EventRecord) -> Result<(), TrackerDataError> {
        record.validate()?;
        let mut first_error = None;
        for tracker in &mut self.trackers {
            if let Err(err) = tracker.process(record) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Feed records in order. Rejected records are logged and counted.
    pub fn scan<'a>(&mut self, records: impl IntoIterator<Item = &'a EventRecord>) -> ScanReport {
        for record in records {
            match self.process(record) {
                Ok(()) => self.processed += 1,
                Err(err) => {
                    self.rejected += 1;
                    warn!(user_id = %record.user_id, event = %record.event_name, error = %err, "record rejected");
                }
            }
        }
        self.report()
    }

    #[must_use]
    pub fn report(&self) -> ScanReport {
        ScanReport {
            results: self.trackers.iter().map(QueryTracker::result).collect(),
            processed: self.processed,
            rejected: self.rejected,
        }
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

    fn funnel(query_type: &str) -> QueryDefinition {
        definition(json!({
            "name": "abc",
            "ty": query_type,
            "ec": "all_given_event",
            "sequential": true,
            "ewp": [{"na": "A"}, {"na": "B"}, {"na": "C"}]
        }))
    }

    fn flat(condition: &str, query_type: &str) -> QueryDefinition {
        definition(json!({
            "name": condition,
            "ty": query_type,
            "ec": condition,
            "ewp": [
                {"na": "A"},
                {"na": "B", "pr": [{"en": "event", "ty": "categorical", "pr": "plan", "op": "equals", "va": "paid"}]}
            ]
        }))
    }

    fn record(user: &str, event: &str, ts: i64) -> EventRecord {
        EventRecord::new(user, event, ts)
    }

    #[test]
    fn ordered_funnel_completes_once_per_user() {
        let mut tracker = QueryTracker::new(&funnel("unique_users")).unwrap();
        for r in [record("U1", "A", 0), record("U1", "B", 10), record("U1", "C", 20)] {
            tracker.process(&r).unwrap();
        }
        assert_eq!(tracker.count(), 1);
    }

    #[test]
    fn out_of_order_record_is_rejected_without_advancing() {
        let mut tracker = QueryTracker::new(&funnel("unique_users")).unwrap();
        assert!(!tracker.process(&record("U2", "C", 0)).unwrap());
        assert!(!tracker.process(&record("U2", "B", 10)).unwrap());
        let err = tracker.process(&record("U2", "A", 5)).unwrap_err();
        assert_eq!(
            err,
            TrackerDataError::OutOfOrder {
                user_id: "U2".to_string(),
                timestamp: 5,
                previous: 10
            }
        );
        assert_eq!(tracker.waiting_on(), 0);
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn all_needs_every_event_while_any_needs_one() {
        let a = record("U1", "A", 0);
        let mut b = record("U1", "B", 1);
        b.event_properties.insert("plan".to_string(), json!("free"));

        let mut all = QueryTracker::new(&flat("all_given_event", "unique_users")).unwrap();
        let mut any = QueryTracker::new(&flat("any_given_event", "unique_users")).unwrap();
        assert!(!all.process(&a).unwrap());
        assert!(!all.process(&b).unwrap());
        assert!(any.process(&a).unwrap());
        assert_eq!(all.count(), 0);
        assert_eq!(any.count(), 1);

        let mut paid = record("U1", "B", 2);
        paid.event_properties.insert("plan".to_string(), json!("Paid"));
        assert!(all.process(&paid).unwrap());
        assert_eq!(all.count(), 1);
    }

    #[test]
    fn occurrences_recount_and_carry_state_across_users() {
        let records = [
            record("U1", "A", 0),
            record("U1", "B", 1),
            record("U1", "C", 2),
            record("U1", "A", 3),
            record("U1", "B", 4),
            record("U1", "C", 5),
            record("U2", "A", 0),
            record("U2", "B", 1),
            record("U3", "C", 0),
        ];
        let mut occurrences = QueryTracker::new(&funnel("events_occurrence")).unwrap();
        let mut users = QueryTracker::new(&funnel("unique_users")).unwrap();
        for r in &records {
            occurrences.process(r).unwrap();
            users.process(r).unwrap();
        }
        assert_eq!(occurrences.count(), 3);
        assert_eq!(users.count(), 1);
    }

    #[test]
    fn each_condition_attributes_counts_per_event() {
        let mut paid = record("U1", "B", 1);
        paid.event_properties.insert("plan".to_string(), json!("paid"));
        let records = [record("U1", "A", 0), paid, record("U1", "A", 2), record("U2", "A", 0)];

        let mut occurrences = QueryTracker::new(&flat("each_given_event", "events_occurrence")).unwrap();
        let mut users = QueryTracker::new(&flat("each_given_event", "unique_users")).unwrap();
        for r in &records {
            occurrences.process(r).unwrap();
            users.process(r).unwrap();
        }

        let per_event = |tracker: &QueryTracker| -> Vec<u64> {
            tracker.result().per_event.iter().map(|e| e.count).collect()
        };
        assert_eq!(occurrences.count(), 4);
        assert_eq!(per_event(&occurrences), vec![3, 1]);
        assert_eq!(users.count(), 2);
        assert_eq!(per_event(&users), vec![2, 1]);
    }

    #[test]
    fn completions_are_grouped_by_property_values() {
        let query = definition(json!({
            "name": "grouped",
            "ty": "unique_users",
            "ec": "any_given_event",
            "ewp": [{"na": "A"}],
            "gbp": [{"en": "user", "pr": "$country"}]
        }));
        let mut set = TrackerSet::new([&query]).unwrap();
        let mut india = record("U1", "A", 0);
        india.user_properties.insert("$country".to_string(), json!("India"));
        let mut also_india = record("U2", "A", 0);
        also_india.user_properties.insert("$country".to_string(), json!("India"));
        let report = set.scan(&[india, also_india, record("U3", "A", 0)]);

        let groups: Vec<_> = report.results[0]
            .groups
            .iter()
            .map(|g| (g.values.join(","), g.count))
            .collect();
        assert_eq!(groups, vec![("$none".to_string(), 1), ("India".to_string(), 2)]);
    }

    #[test]
    fn scan_counts_rejected_records_and_keeps_going() {
        let mut set = TrackerSet::new([&funnel("unique_users"), &flat("any_given_event", "events_occurrence")]).unwrap();
        let report = set.scan(&[
            record("", "A", 0),
            record("U1", "", 0),
            record("U1", "A", -1),
            record("U1", "A", 10),
            record("U1", "B", 5),
            record("U1", "B", 11),
            record("U1", "C", 12),
        ]);
        assert_eq!(report.rejected, 4);
        assert_eq!(report.processed, 3);
        assert_eq!(report.results[0].count, 1);
        assert_eq!(report.results[1].count, 1);
    }

    #[test]
    fn invalid_query_fails_the_set() {
        let mut bad = funnel("unique_users");
        bad.condition = "most_given_event".to_string();
        assert!(matches!(
            TrackerSet::new([&funnel("unique_users"), &bad]),
            Err(QueryValidationError::UnknownCondition(_))
        ));
    }
}
