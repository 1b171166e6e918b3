//! Remote push capability and its wire messages

use async_trait::async_trait;
use bytes::Bytes;
use tether_core::Server;

use crate::error::Result;

/// Push for a single user, routed to the frontend server holding the session
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Push {
    #[prost(string, tag = "1")]
    pub route: String,
    #[prost(string, tag = "2")]
    pub uid: String,
    #[prost(bytes = "bytes", tag = "3")]
    pub data: Bytes,
}

/// Push shared by a batch of users of one frontend type
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MultiPush {
    #[prost(string, tag = "1")]
    pub route: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub data: Bytes,
}

/// Carries pushes to other servers of the cluster
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemotePusher: Send + Sync {
    /// Deliver `push` to `uid` on a server matching `target`. Only the
    /// target's type is meaningful; the transport resolves the server id.
    async fn send_push(&self, uid: &str, target: &Server, push: Push) -> Result<()>;

    /// Deliver one message to every uid in `uids` on servers of
    /// `frontend_type`. Fails as a whole.
    async fn push_to_users(
        &self,
        uids: Vec<String>,
        frontend_type: &str,
        push: MultiPush,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_push_wire_layout() {
        let push = Push {
            route: "a.b".to_string(),
            uid: "7".to_string(),
            data: Bytes::from_static(b"x"),
        };
        // field 1 "a.b", field 2 "7", field 3 b"x"
        assert_eq!(
            push.encode_to_vec(),
            vec![0x0a, 3, b'a', b'.', b'b', 0x12, 1, b'7', 0x1a, 1, b'x']
        );
    }

    #[test]
    fn test_multi_push_decode() {
        let encoded = MultiPush {
            route: "connector.handler.notify".to_string(),
            data: Bytes::from_static(b"{}"),
        }
        .encode_to_vec();
        let decoded = MultiPush::decode(encoded.as_slice()).unwrap();
        assert_eq!(decoded.route, "connector.handler.notify");
        assert_eq!(decoded.data, Bytes::from_static(b"{}"));
    }
}
