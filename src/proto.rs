//! Wire messages for the push gateway and the OurCloud node API.
//!
//! The protocol is small enough that the messages are written out by hand
//! rather than generated from `.proto` files. Field numbers are load-bearing:
//! they must stay in sync with the OurCloud node and the mobile clients.

use prost::Message;

/// Inbound push request, signed by the sender.
#[derive(Clone, PartialEq, Message)]
pub struct PushRequest {
    #[prost(string, tag = "1")]
    pub sender_username: String,
    #[prost(string, tag = "2")]
    pub target_username: String,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub target_node_ids: Vec<Vec<u8>>,
    /// UNIX seconds at the sender.
    #[prost(int64, tag = "4")]
    pub timestamp: i64,
    /// Content identifiers the recipient should fetch (typically 32-byte hashes).
    #[prost(bytes = "vec", repeated, tag = "5")]
    pub data_ids: Vec<Vec<u8>>,
    /// Detached ed25519 signature over [`signed_bytes`].
    #[prost(bytes = "vec", tag = "6")]
    pub signature: Vec<u8>,
}

/// Response to `POST /push`.
#[derive(Clone, PartialEq, Message)]
pub struct PushResponse {
    #[prost(bool, tag = "1")]
    pub accepted: bool,
    #[prost(string, tag = "2")]
    pub request_id: String,
    #[prost(int32, tag = "3")]
    pub error_code: i32,
    #[prost(string, tag = "4")]
    pub message: String,
}

/// Envelope carried in the FCM data payload: the content identifiers the
/// device should pull from the network.
#[derive(Clone, PartialEq, Message)]
pub struct DataUpdateNotification {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub data_ids: Vec<Vec<u8>>,
}

/// The bytes a `PushRequest` signature covers: the request encoded with its
/// signature field cleared. Prost writes fields in tag order, so the encoding
/// is deterministic.
pub fn signed_bytes(req: &PushRequest) -> Vec<u8> {
    let mut unsigned = req.clone();
    unsigned.signature.clear();
    unsigned.encode_to_vec()
}

// --- OurCloud node surface (service `ourcloud.BlockStorageAPI`) ---

#[derive(Clone, PartialEq, Message)]
pub struct FormatVersion {
    #[prost(uint32, tag = "1")]
    pub value: u32,
}

/// Content address of a stored block.
#[derive(Clone, PartialEq, Message)]
pub struct Id {
    #[prost(bytes = "vec", tag = "1")]
    pub value: Vec<u8>,
}

/// A user's public authentication record. Its content address is the user's
/// owner id in the label namespace.
#[derive(Clone, PartialEq, Message)]
pub struct UserAuth {
    #[prost(message, optional, tag = "1")]
    pub format_version: Option<FormatVersion>,
    #[prost(string, tag = "2")]
    pub user_name: String,
    #[prost(bytes = "vec", tag = "3")]
    pub public_sign_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub public_crypt_key: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Label {
    #[prost(message, optional, tag = "1")]
    pub data_id: Option<Id>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RawData {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Datum {
    #[prost(oneof = "datum::Data", tags = "1")]
    pub data: Option<datum::Data>,
}

pub mod datum {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Data {
        #[prost(message, tag = "1")]
        RawData(super::RawData),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct GetLabelRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetLabelResponse {
    #[prost(bool, tag = "1")]
    pub found: bool,
    #[prost(message, optional, tag = "2")]
    pub label: Option<Label>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetBlockRequest {
    #[prost(message, optional, tag = "1")]
    pub id: Option<Id>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetBlockResponse {
    #[prost(bool, tag = "1")]
    pub found: bool,
    #[prost(message, optional, tag = "2")]
    pub block: Option<Datum>,
}

/// Per-user consent list: senders allowed to trigger pushes.
#[derive(Clone, PartialEq, Message)]
pub struct PushConsent {
    #[prost(string, tag = "1")]
    pub username: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct PushConsentList {
    #[prost(message, repeated, tag = "1")]
    pub consents: Vec<PushConsent>,
}

/// One registered device.
#[derive(Clone, PartialEq, Message)]
pub struct PushEndpoint {
    #[prost(string, tag = "1")]
    pub device_id: String,
    #[prost(string, tag = "2")]
    pub fcm_token: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct PushEndpointList {
    #[prost(message, repeated, tag = "1")]
    pub endpoints: Vec<PushEndpoint>,
}
