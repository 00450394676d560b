use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub request_id: Option<String>,
}

// `?channels=a,b` on both streaming endpoints.
#[derive(Debug, Deserialize, Default)]
pub struct ChannelsQuery {
    pub channels: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PublishAccepted {
    pub channel: String,
    pub distributed: bool,
}
