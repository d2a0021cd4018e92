//! Turns a metadata-format Gmail message into [`MessageMetadata`]
//!
//! Only headers, label ids and the snippet are read. A response that carries
//! any body bytes is rejected outright.

use chrono::{DateTime, TimeZone, Utc};
use google_gmail1::api::{Message, MessagePart};
use tracing::warn;

use crate::error::{Result, TriageError};
use crate::models::{ListHeaders, MessageCategory, MessageMetadata, SNIPPET_MAX_CHARS};

pub fn extract(message: Message) -> Result<MessageMetadata> {
    if message.raw.as_ref().is_some_and(|raw| !raw.is_empty()) {
        return Err(TriageError::PolicyViolation(
            "message response carried raw content".to_string(),
        ));
    }
    if let Some(payload) = message.payload.as_ref() {
        if carries_body(payload) {
            return Err(TriageError::PolicyViolation(
                "message response carried body data".to_string(),
            ));
        }
    }

    let id = message
        .id
        .ok_or_else(|| TriageError::InvalidMessageFormat("Missing message ID".to_string()))?;
    let thread_id = message.thread_id.unwrap_or_else(|| id.clone());
    let labels = message.label_ids.unwrap_or_default();

    let mut sender_email = String::new();
    let mut sender_name = String::new();
    let mut subject = String::new();
    let mut date_str = String::new();
    let mut headers = ListHeaders::default();

    let header_list = message
        .payload
        .and_then(|p| p.headers)
        .unwrap_or_default();

    for header in header_list {
        let (Some(name), Some(value)) = (header.name, header.value) else {
            continue;
        };
        match name.to_ascii_lowercase().as_str() {
            "from" => {
                // "Name <email@example.com>" or a bare address
                if let Some((name_part, email_part)) = parse_email_header(&value) {
                    sender_name = name_part;
                    sender_email = email_part;
                } else {
                    sender_email = value.trim().to_string();
                }
            }
            "subject" => subject = value,
            "date" => date_str = value,
            "list-unsubscribe" => headers.has_unsubscribe = true,
            // Mailing-list distribution, like `Precedence: list`
            "list-id" => headers.is_bulk = true,
            "precedence" => {
                let value = value.trim().to_ascii_lowercase();
                headers.is_bulk |= matches!(value.as_str(), "bulk" | "list" | "junk");
            }
            "auto-submitted" => {
                headers.is_auto_generated |= !value.trim().eq_ignore_ascii_case("no");
            }
            _ => {}
        }
    }

    let sender_email = sender_email.to_lowercase();
    let sender_domain = sender_email
        .rsplit_once('@')
        .map(|(_, domain)| domain.to_string())
        .unwrap_or_default();

    let date_received = match parse_date(&date_str) {
        Ok(date) => date,
        Err(_) => message
            .internal_date
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(|| {
                warn!(message_id = %id, "No usable Date header or internal date");
                Utc::now()
            }),
    };

    let category = category_from_labels(&labels);
    let snippet = truncate_snippet(&decode_entities(&message.snippet.unwrap_or_default()));

    Ok(MessageMetadata {
        id,
        thread_id,
        sender_email,
        sender_domain,
        sender_name,
        subject,
        snippet,
        labels,
        category,
        headers,
        date_received,
    })
}

fn carries_body(part: &MessagePart) -> bool {
    let has_data = part
        .body
        .as_ref()
        .and_then(|b| b.data.as_ref())
        .is_some_and(|data| !data.is_empty());

    has_data || part.parts.iter().flatten().any(carries_body)
}

/// Map CATEGORY_* label ids to a category
pub fn category_from_labels(labels: &[String]) -> MessageCategory {
    for label in labels {
        let category = match label.as_str() {
            "CATEGORY_PROMOTIONS" => MessageCategory::Promotions,
            "CATEGORY_SOCIAL" => MessageCategory::Social,
            "CATEGORY_UPDATES" => MessageCategory::Updates,
            "CATEGORY_FORUMS" => MessageCategory::Forums,
            "CATEGORY_PERSONAL" => MessageCategory::Primary,
            _ => continue,
        };
        return category;
    }
    MessageCategory::Unknown
}

/// Parse email header in "Name <email@example.com>" format
fn parse_email_header(header: &str) -> Option<(String, String)> {
    let start = header.find('<')?;
    let end = header[start..].find('>')? + start;
    let name = header[..start].trim().trim_matches('"').to_string();
    let email = header[start + 1..end].trim().to_string();
    Some((name, email))
}

/// Parse RFC 2822 date string, ignoring a trailing "(UTC)"-style comment
fn parse_date(date_str: &str) -> Result<DateTime<Utc>> {
    let trimmed = match date_str.find('(') {
        Some(idx) => date_str[..idx].trim(),
        None => date_str.trim(),
    };

    DateTime::parse_from_rfc2822(trimmed)
        .or_else(|_| DateTime::parse_from_rfc3339(trimmed))
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TriageError::InvalidMessageFormat(format!("Invalid date format: {}", e)))
}

/// Gmail returns snippets HTML-escaped
fn decode_entities(snippet: &str) -> String {
    snippet
        .replace("&#39;", "'")
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn truncate_snippet(snippet: &str) -> String {
    snippet.chars().take(SNIPPET_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use google_gmail1::api::{MessagePartBody, MessagePartHeader};

    fn header(name: &str, value: &str) -> MessagePartHeader {
        MessagePartHeader {
            name: Some(name.to_string()),
            value: Some(value.to_string()),
        }
    }

    fn message(headers: Vec<MessagePartHeader>, labels: &[&str]) -> Message {
        Message {
            id: Some("msg1".to_string()),
            thread_id: Some("thread1".to_string()),
            label_ids: Some(labels.iter().map(|l| l.to_string()).collect()),
            snippet: Some("Don&#39;t miss our deals".to_string()),
            internal_date: Some(1_700_000_000_000),
            payload: Some(MessagePart {
                headers: Some(headers),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_extracts_sender_and_markers() {
        let meta = extract(message(
            vec![
                header("From", "\"Shop Deals\" <Deals@Shop.Example.com>"),
                header("Subject", "Weekend sale"),
                header("Date", "Mon, 24 Nov 2025 10:30:00 +0000 (UTC)"),
                header("List-Unsubscribe", "<mailto:unsub@shop.example.com>"),
                header("Precedence", "Bulk"),
                header("Auto-Submitted", "auto-generated"),
            ],
            &["INBOX", "CATEGORY_PROMOTIONS"],
        ))
        .unwrap();

        assert_eq!(meta.sender_name, "Shop Deals");
        assert_eq!(meta.sender_email, "deals@shop.example.com");
        assert_eq!(meta.sender_domain, "shop.example.com");
        assert_eq!(meta.category, MessageCategory::Promotions);
        assert!(meta.headers.has_unsubscribe);
        assert!(meta.headers.is_bulk);
        assert!(meta.headers.is_auto_generated);
        assert_eq!(meta.snippet, "Don't miss our deals");
        assert_eq!(meta.date_received.to_rfc3339(), "2025-11-24T10:30:00+00:00");
    }

    #[test]
    fn test_auto_submitted_no_is_not_automated() {
        let meta = extract(message(
            vec![
                header("From", "friend@example.com"),
                header("Auto-Submitted", "no"),
                header("List-Id", "<team.example.com>"),
            ],
            &["INBOX"],
        ))
        .unwrap();

        assert_eq!(meta.sender_email, "friend@example.com");
        assert_eq!(meta.sender_name, "");
        assert!(!meta.headers.is_auto_generated);
        // List membership alone is not an unsubscribe offer
        assert!(!meta.headers.has_unsubscribe);
        assert!(meta.headers.is_bulk);
        assert_eq!(meta.category, MessageCategory::Unknown);
    }

    #[test]
    fn test_falls_back_to_internal_date() {
        let meta = extract(message(
            vec![header("From", "a@b.com"), header("Date", "not a date")],
            &[],
        ))
        .unwrap();
        assert_eq!(meta.date_received.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_snippet_is_truncated() {
        let mut msg = message(vec![header("From", "a@b.com")], &[]);
        msg.snippet = Some("é".repeat(500));
        let meta = extract(msg).unwrap();
        assert_eq!(meta.snippet.chars().count(), SNIPPET_MAX_CHARS);
    }

    #[test]
    fn test_raw_content_is_a_policy_violation() {
        let mut msg = message(vec![], &[]);
        msg.raw = Some(b"From: a@b.com\r\n\r\nbody".to_vec());
        assert!(matches!(extract(msg), Err(TriageError::PolicyViolation(_))));
    }

    #[test]
    fn test_nested_body_data_is_a_policy_violation() {
        let mut msg = message(vec![header("From", "a@b.com")], &[]);
        msg.payload = Some(MessagePart {
            parts: Some(vec![MessagePart {
                body: Some(MessagePartBody {
                    data: Some(b"secret".to_vec()),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(matches!(extract(msg), Err(TriageError::PolicyViolation(_))));
    }

    #[test]
    fn test_empty_body_is_allowed() {
        let mut msg = message(vec![header("From", "a@b.com")], &[]);
        msg.payload = Some(MessagePart {
            body: Some(MessagePartBody {
                size: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert!(extract(msg).is_ok());
    }

    #[test]
    fn test_parse_email_header() {
        assert_eq!(
            parse_email_header("John Doe <john@example.com>"),
            Some(("John Doe".to_string(), "john@example.com".to_string()))
        );
        assert_eq!(
            parse_email_header("\"Jane Smith\" <jane@example.com>"),
            Some(("Jane Smith".to_string(), "jane@example.com".to_string()))
        );
        assert_eq!(parse_email_header("plain@example.com"), None);
    }

    #[test]
    fn test_category_mapping() {
        assert_eq!(
            category_from_labels(&["CATEGORY_PERSONAL".to_string()]),
            MessageCategory::Primary
        );
        assert_eq!(
            category_from_labels(&["INBOX".to_string(), "CATEGORY_SOCIAL".to_string()]),
            MessageCategory::Social
        );
    }
}
