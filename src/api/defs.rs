//! Wire schemas of the control API
//!
//! Field names and shapes follow the v3 JSON surface: list responses carry
//! `{itemCount, pageCount, items}` with items in creation-time order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::path::PathSnapshot;
use crate::registry::SessionSnapshot;

/// Error body returned with every 4xx/5xx
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
}

/// `{type, id}` reference to a publisher, source or reader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSourceOrReader {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiPath {
    pub name: String,
    pub conf_name: String,
    pub source: Option<ApiSourceOrReader>,
    pub ready: bool,
    pub ready_time: Option<DateTime<Utc>>,
    pub tracks: Vec<String>,
    pub bytes_received: u64,
    pub readers: Vec<ApiSourceOrReader>,
}

impl From<&PathSnapshot> for ApiPath {
    fn from(snapshot: &PathSnapshot) -> Self {
        let as_ref = |e: &crate::path::EndpointRef| ApiSourceOrReader {
            kind: e.kind.as_str().to_string(),
            id: e.id.to_string(),
        };
        ApiPath {
            name: snapshot.name.clone(),
            conf_name: snapshot.conf_name.clone(),
            source: snapshot.source.as_ref().map(as_ref),
            ready: snapshot.ready,
            ready_time: snapshot.ready_time,
            tracks: snapshot.tracks.clone(),
            bytes_received: snapshot.bytes_received,
            readers: snapshot.readers.iter().map(as_ref).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRtspConn {
    pub id: String,
    pub created: DateTime<Utc>,
    pub remote_addr: String,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRtspSession {
    pub id: String,
    pub created: DateTime<Utc>,
    pub remote_addr: String,
    pub state: String,
    pub path: String,
    pub transport: Option<String>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRtmpConn {
    pub id: String,
    pub created: DateTime<Utc>,
    pub remote_addr: String,
    pub state: String,
    pub path: String,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSrtConn {
    pub id: String,
    pub created: DateTime<Utc>,
    pub remote_addr: String,
    pub state: String,
    pub path: String,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiWebRtcSession {
    pub id: String,
    pub created: DateTime<Utc>,
    pub remote_addr: String,
    pub peer_connection_established: bool,
    pub local_candidate: String,
    pub remote_candidate: String,
    pub state: String,
    pub path: String,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

impl From<&SessionSnapshot> for ApiRtspConn {
    fn from(s: &SessionSnapshot) -> Self {
        ApiRtspConn {
            id: s.id.to_string(),
            created: s.created,
            remote_addr: s.remote_addr.to_string(),
            bytes_received: s.bytes_received,
            bytes_sent: s.bytes_sent,
        }
    }
}

impl From<&SessionSnapshot> for ApiRtspSession {
    fn from(s: &SessionSnapshot) -> Self {
        ApiRtspSession {
            id: s.id.to_string(),
            created: s.created,
            remote_addr: s.remote_addr.to_string(),
            state: s.state.as_str().to_string(),
            path: s.path.clone(),
            transport: s.transport.clone(),
            bytes_received: s.bytes_received,
            bytes_sent: s.bytes_sent,
        }
    }
}

impl From<&SessionSnapshot> for ApiRtmpConn {
    fn from(s: &SessionSnapshot) -> Self {
        ApiRtmpConn {
            id: s.id.to_string(),
            created: s.created,
            remote_addr: s.remote_addr.to_string(),
            state: s.state.as_str().to_string(),
            path: s.path.clone(),
            bytes_received: s.bytes_received,
            bytes_sent: s.bytes_sent,
        }
    }
}

impl From<&SessionSnapshot> for ApiSrtConn {
    fn from(s: &SessionSnapshot) -> Self {
        ApiSrtConn {
            id: s.id.to_string(),
            created: s.created,
            remote_addr: s.remote_addr.to_string(),
            state: s.state.as_str().to_string(),
            path: s.path.clone(),
            bytes_received: s.bytes_received,
            bytes_sent: s.bytes_sent,
        }
    }
}

impl From<&SessionSnapshot> for ApiWebRtcSession {
    fn from(s: &SessionSnapshot) -> Self {
        ApiWebRtcSession {
            id: s.id.to_string(),
            created: s.created,
            remote_addr: s.remote_addr.to_string(),
            peer_connection_established: s.established,
            local_candidate: s.local_candidate.clone(),
            remote_candidate: s.remote_candidate.clone(),
            state: s.state.as_str().to_string(),
            path: s.path.clone(),
            bytes_received: s.bytes_received,
            bytes_sent: s.bytes_sent,
        }
    }
}

/// Paged list wrapper
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiList<T> {
    pub item_count: usize,
    pub page_count: usize,
    pub items: Vec<T>,
}

/// `page` / `itemsPerPage` query parameters
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageQuery {
    pub page: usize,
    pub items_per_page: usize,
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            page: 0,
            items_per_page: 100,
        }
    }
}

/// Slice one page out of the full item set
pub fn paginate<T>(items: Vec<T>, query: &PageQuery) -> ApiList<T> {
    let per_page = query.items_per_page.max(1);
    let item_count = items.len();
    let page_count = item_count.div_ceil(per_page);

    let items = items
        .into_iter()
        .skip(query.page.saturating_mul(per_page))
        .take(per_page)
        .collect();

    ApiList {
        item_count,
        page_count,
        items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(page: usize, per: usize) -> PageQuery {
        PageQuery {
            page,
            items_per_page: per,
        }
    }

    #[test]
    fn test_paginate_counts() {
        let list = paginate((0..25).collect::<Vec<_>>(), &query(0, 10));
        assert_eq!(list.item_count, 25);
        assert_eq!(list.page_count, 3);
        assert_eq!(list.items, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_paginate_last_page() {
        let list = paginate((0..25).collect::<Vec<_>>(), &query(2, 10));
        assert_eq!(list.items, (20..25).collect::<Vec<_>>());
    }

    #[test]
    fn test_paginate_out_of_range() {
        let list = paginate((0..5).collect::<Vec<_>>(), &query(7, 10));
        assert!(list.items.is_empty());
        assert_eq!(list.item_count, 5);
        assert_eq!(list.page_count, 1);
    }

    #[test]
    fn test_paginate_empty() {
        let list = paginate(Vec::<u32>::new(), &query(0, 10));
        assert_eq!(list.item_count, 0);
        assert_eq!(list.page_count, 0);
    }

    #[test]
    fn test_api_path_serialization() {
        let path = ApiPath {
            name: "cam1".to_string(),
            conf_name: "all".to_string(),
            source: Some(ApiSourceOrReader {
                kind: "webRTCSession".to_string(),
                id: "x".to_string(),
            }),
            ready: true,
            ready_time: None,
            tracks: vec!["video".to_string()],
            bytes_received: 7,
            readers: Vec::new(),
        };

        let json = serde_json::to_value(&path).unwrap();
        assert_eq!(json["confName"], "all");
        assert_eq!(json["source"]["type"], "webRTCSession");
        assert_eq!(json["bytesReceived"], 7);
    }
}
