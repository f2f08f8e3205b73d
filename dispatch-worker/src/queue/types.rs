//! Message types shared by the durable queue and the HTTP intake API.
//!
//! Both carry the same JSON batch:
//!
//! ```json
//! {"messages": [{"topicId": "t1", "email": "a@example.com", "subject": "Hi", "content": "<p>..</p>"}]}
//! ```

use serde::{Deserialize, Serialize};

/// Default name of the durable queue.
pub const DEFAULT_QUEUE_NAME: &str = "email-queue";

/// A batch of email requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailBatch {
    #[serde(default)]
    pub messages: Vec<EmailMessage>,
}

/// One email request as submitted by a producer.
///
/// Missing fields deserialize as empty strings and are rejected by intake
/// validation rather than failing the whole batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    /// Grouping tag used for statistics
    #[serde(default, rename = "topicId")]
    pub topic_id: String,
    /// Recipient email address
    #[serde(default)]
    pub email: String,
    /// Email subject
    #[serde(default)]
    pub subject: String,
    /// HTML body
    #[serde(default)]
    pub content: String,
}

/// A message received from the durable queue, pending deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Broker handle used to delete the message
    pub receipt: u64,
    /// Optional broker-side message id, for logging
    pub message_id: Option<String>,
    /// Raw JSON body
    pub body: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_deserialization() {
        let json = r#"{
            "messages": [
                {"topicId": "t1", "email": "a@example.com", "subject": "Hi", "content": "<p>Hi</p>"},
                {"topicId": "t1", "email": "b@example.com"}
            ]
        }"#;

        let batch: EmailBatch = serde_json::from_str(json).unwrap();
        assert_eq!(batch.messages.len(), 2);
        assert_eq!(batch.messages[0].topic_id, "t1");
        assert_eq!(batch.messages[0].content, "<p>Hi</p>");
        assert_eq!(batch.messages[1].subject, "");
    }

    #[test]
    fn test_batch_serializes_camel_case_topic() {
        let batch = EmailBatch {
            messages: vec![EmailMessage {
                topic_id: "launch".to_string(),
                ..EmailMessage::default()
            }],
        };
        let json = serde_json::to_string(&batch).unwrap();
        assert!(json.contains("\"topicId\":\"launch\""));
    }

    #[test]
    fn test_empty_object_is_empty_batch() {
        let batch: EmailBatch = serde_json::from_str("{}").unwrap();
        assert!(batch.messages.is_empty());
    }
}
