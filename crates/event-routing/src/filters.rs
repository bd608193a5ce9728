// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Drop filters applied to annotated events. A filter returning `true` drops the event.

use crate::event::{Event, IGNORED_APP_FIELD, ORG_NAME_FIELD, SPACE_NAME_FIELD};

pub type EventFilter = Box<dyn Fn(&mut Event) -> bool + Send + Sync>;

/// Drops events of opted-out apps. Always strips the marker field.
pub fn has_ignore_field(event: &mut Event) -> bool {
    matches!(
        event.fields.remove(IGNORED_APP_FIELD),
        Some(serde_json::Value::Bool(true))
    )
}

/// Drops events whose org is known and not in the comma-separated `org_filters`. An empty list
/// keeps everything.
#[must_use]
pub fn not_in_certain_orgs(org_filters: &str) -> EventFilter {
    let orgs: Vec<String> = split_list(org_filters).map(str::to_string).collect();
    Box::new(move |event: &mut Event| {
        if orgs.is_empty() {
            return false;
        }
        match event.field_str(ORG_NAME_FIELD) {
            Some(org_name) => !orgs.iter().any(|org| org == org_name),
            None => false,
        }
    })
}

/// Drops events whose org and space are known and match none of the `org:space` pairs.
#[must_use]
pub fn not_in_certain_spaces(space_filters: Vec<(String, String)>) -> EventFilter {
    Box::new(move |event: &mut Event| {
        if space_filters.is_empty() {
            return false;
        }
        let (Some(org_name), Some(space_name)) = (
            event.field_str(ORG_NAME_FIELD),
            event.field_str(SPACE_NAME_FIELD),
        ) else {
            return false;
        };
        if space_name.is_empty() {
            return false;
        }
        !space_filters
            .iter()
            .any(|(org, space)| org == org_name && space == space_name)
    })
}

/// Parses `org:space,org:space`. Entries without exactly one `:` are skipped.
#[must_use]
pub fn parse_space_filters(spaces: &str) -> Vec<(String, String)> {
    split_list(spaces)
        .filter_map(|pair| {
            let (org, space) = pair.split_once(':')?;
            let (org, space) = (org.trim(), space.trim());
            if org.is_empty() || space.is_empty() || space.contains(':') {
                tracing::warn!("Ignoring malformed space filter {pair}");
                return None;
            }
            Some((org.to_string(), space.to_string()))
        })
        .collect()
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|item| !item.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn event(org: Option<&str>, space: Option<&str>) -> Event {
        let mut event = Event {
            fields: serde_json::Map::new(),
            msg: String::new(),
            event_type: "LogMessage".to_string(),
        };
        if let Some(org) = org {
            event.insert(ORG_NAME_FIELD, org);
        }
        if let Some(space) = space {
            event.insert(SPACE_NAME_FIELD, space);
        }
        event
    }

    #[test]
    fn test_has_ignore_field_drops_and_strips() {
        let mut ignored = event(None, None);
        ignored.insert(IGNORED_APP_FIELD, true);
        assert!(has_ignore_field(&mut ignored));
        assert!(!ignored.fields.contains_key(IGNORED_APP_FIELD));

        let mut kept = event(None, None);
        kept.insert(IGNORED_APP_FIELD, false);
        assert!(!has_ignore_field(&mut kept));
        assert!(!kept.fields.contains_key(IGNORED_APP_FIELD));

        let mut unmarked = event(None, None);
        unmarked.insert(IGNORED_APP_FIELD, Value::String("true".to_string()));
        assert!(!has_ignore_field(&mut unmarked));
    }

    #[test]
    fn test_not_in_certain_orgs() {
        let filter = not_in_certain_orgs("acme, globex");
        assert!(!filter(&mut event(Some("acme"), None)));
        assert!(!filter(&mut event(Some("globex"), None)));
        assert!(filter(&mut event(Some("initech"), None)));
        // events without an org are not judged
        assert!(!filter(&mut event(None, None)));

        let keep_all = not_in_certain_orgs("");
        assert!(!keep_all(&mut event(Some("initech"), None)));
    }

    #[test]
    fn test_not_in_certain_spaces() {
        let filter = not_in_certain_spaces(parse_space_filters("acme:prod,globex:dev"));
        assert!(!filter(&mut event(Some("acme"), Some("prod"))));
        assert!(!filter(&mut event(Some("globex"), Some("dev"))));
        assert!(filter(&mut event(Some("acme"), Some("dev"))));
        assert!(!filter(&mut event(Some("acme"), None)));
        assert!(!filter(&mut event(None, Some("prod"))));

        let keep_all = not_in_certain_spaces(Vec::new());
        assert!(!keep_all(&mut event(Some("acme"), Some("dev"))));
    }

    #[test]
    fn test_parse_space_filters_skips_malformed_pairs() {
        assert_eq!(
            parse_space_filters(" acme : prod ,nope, a:b:c, :x,globex:dev"),
            vec![
                ("acme".to_string(), "prod".to_string()),
                ("globex".to_string(), "dev".to_string())
            ]
        );
        assert!(parse_space_filters("").is_empty());
    }
}
