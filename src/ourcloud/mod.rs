//! Client for the OurCloud node: content-addressed reads of user auth
//! records, push consent lists, and push endpoint lists.
//!
//! The node stores everything as labeled blocks. A user's owner id is the
//! SHA-256 of their deterministically encoded `UserAuth`; a label key is the
//! SHA-256 of the owner id concatenated with the label path. User records
//! themselves are labeled under a well-known root namespace.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use prost::Message;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tracing::info;

use crate::proto::{
    datum, GetBlockRequest, GetBlockResponse, GetLabelRequest, GetLabelResponse, Id, Label,
    PushConsentList, PushEndpoint, PushEndpointList, PushRequest, UserAuth,
};

pub mod verify;

const PATH_GET_LABEL: &str = "/ourcloud.BlockStorageAPI/GetLabel";
const PATH_GET_BLOCK: &str = "/ourcloud.BlockStorageAPI/GetBlock";

/// Well-known identity used by `health_check`.
pub const HEALTH_CHECK_USER: &str = "root@oc";

fn label_path_push_consents(username: &str) -> String {
    format!("/users/{username}/platform/push/consents")
}

fn label_path_push_endpoints(username: &str) -> String {
    format!("/users/{username}/platform/push/endpoints")
}

/// The root namespace owner id: 32 bytes, all zero except the final byte.
fn root_id() -> [u8; 32] {
    let mut id = [0u8; 32];
    id[31] = 1;
    id
}

fn content_address(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Owner id of a stored record: the content address of its encoding.
fn message_content_address<M: Message>(msg: &M) -> [u8; 32] {
    content_address(&msg.encode_to_vec())
}

fn label_key(owner_id: &[u8], path: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(owner_id);
    hasher.update(path);
    hasher.finalize().to_vec()
}

/// The metadata operations the request pipeline depends on.
#[async_trait]
pub trait OurCloudService: Send + Sync {
    /// Whether `req` carries a valid signature from its claimed sender.
    /// Fails when the sender cannot be looked up.
    async fn verify_push_request(&self, req: &PushRequest) -> Result<bool>;

    /// Whether `sender` appears in `recipient`'s push consent list.
    async fn has_consent(&self, recipient: &str, sender: &str) -> Result<bool>;

    /// The recipient's registered push endpoints; may be empty.
    async fn get_endpoints(&self, username: &str) -> Result<Vec<PushEndpoint>>;

    /// Connectivity probe: a lookup of a well-known identity.
    async fn health_check(&self) -> Result<()>;
}

/// gRPC client for an OurCloud node. `connect`/`close` take the write side
/// of the lock; calls clone the channel under the read side.
pub struct OurCloudClient {
    address: String,
    channel: RwLock<Option<Channel>>,
}

impl OurCloudClient {
    /// `address` is `host:port`, e.g. `localhost:50051`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            channel: RwLock::new(None),
        }
    }

    /// Establish the connection. Safe to call twice.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.channel.write().await;
        if guard.is_some() {
            return Ok(());
        }
        let endpoint = Endpoint::from_shared(format!("http://{}", self.address))
            .context("invalid OurCloud address")?;
        let channel = endpoint
            .connect()
            .await
            .context("connecting to OurCloud node")?;
        *guard = Some(channel);
        info!(address = %self.address, "connected to OurCloud node");
        Ok(())
    }

    pub async fn close(&self) {
        *self.channel.write().await = None;
    }

    pub async fn is_connected(&self) -> bool {
        self.channel.read().await.is_some()
    }

    async fn channel(&self) -> Result<Channel> {
        self.channel
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("not connected to OurCloud node"))
    }

    /// One unary call, the way generated tonic clients issue them.
    async fn unary<Req, Resp>(&self, path: &'static str, request: Req) -> Result<Resp>
    where
        Req: Message + Send + Sync + 'static,
        Resp: Message + Default + Send + Sync + 'static,
    {
        let channel = self.channel().await?;
        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| anyhow!("OurCloud service not ready: {e}"))?;
        let codec: tonic::codec::ProstCodec<Req, Resp> = tonic::codec::ProstCodec::default();
        let response = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(path),
                codec,
            )
            .await
            .map_err(|status| anyhow!("OurCloud call failed: {status}"))?;
        Ok(response.into_inner())
    }

    async fn read_label(&self, key: Vec<u8>) -> Result<Label> {
        let resp: GetLabelResponse = self.unary(PATH_GET_LABEL, GetLabelRequest { key }).await?;
        if !resp.found {
            return Err(anyhow!("label not found"));
        }
        resp.label.ok_or_else(|| anyhow!("label response missing label"))
    }

    async fn lookup(&self, id: Vec<u8>) -> Result<Vec<u8>> {
        let resp: GetBlockResponse = self
            .unary(PATH_GET_BLOCK, GetBlockRequest {
                id: Some(Id { value: id }),
            })
            .await?;
        if !resp.found {
            return Err(anyhow!("block not found"));
        }
        match resp.block.and_then(|d| d.data) {
            Some(datum::Data::RawData(raw)) => Ok(raw.data),
            None => Err(anyhow!("block response missing data")),
        }
    }

    /// Fetch a user's public authentication record by username.
    pub async fn get_user_auth(&self, username: &str) -> Result<UserAuth> {
        let label = self
            .read_label(label_key(&root_id(), username.as_bytes()))
            .await
            .with_context(|| format!("looking up user {username:?}"))?;
        let data_id = label
            .data_id
            .ok_or_else(|| anyhow!("user label has no data id"))?;
        let data = self
            .lookup(data_id.value)
            .await
            .with_context(|| format!("fetching user auth for {username:?}"))?;
        UserAuth::decode(data.as_slice()).context("decoding user auth")
    }

    /// Fetch a user's push consent list.
    pub async fn get_consent_list(&self, username: &str) -> Result<PushConsentList> {
        let auth = self
            .get_user_auth(username)
            .await
            .with_context(|| format!("getting user auth for {username:?}"))?;
        let owner_id = message_content_address(&auth);
        let label = self
            .read_label(label_key(&owner_id, label_path_push_consents(username).as_bytes()))
            .await
            .context("reading consent list label")?;
        let data_id = label
            .data_id
            .ok_or_else(|| anyhow!("consent list label has no data id"))?;
        let data = self
            .lookup(data_id.value)
            .await
            .context("looking up consent list data")?;
        PushConsentList::decode(data.as_slice()).context("decoding consent list")
    }

    /// Fetch a user's push endpoint list.
    pub async fn get_endpoint_list(&self, username: &str) -> Result<PushEndpointList> {
        let auth = self
            .get_user_auth(username)
            .await
            .with_context(|| format!("getting user auth for {username:?}"))?;
        let owner_id = message_content_address(&auth);
        let label = self
            .read_label(label_key(&owner_id, label_path_push_endpoints(username).as_bytes()))
            .await
            .context("reading endpoints label")?;
        let data_id = label
            .data_id
            .ok_or_else(|| anyhow!("endpoints label has no data id"))?;
        let data = self
            .lookup(data_id.value)
            .await
            .context("looking up endpoints data")?;
        PushEndpointList::decode(data.as_slice()).context("decoding endpoint list")
    }
}

#[async_trait]
impl OurCloudService for OurCloudClient {
    async fn verify_push_request(&self, req: &PushRequest) -> Result<bool> {
        verify::verify_push_request(self, req).await
    }

    async fn has_consent(&self, recipient: &str, sender: &str) -> Result<bool> {
        let consent_list = self.get_consent_list(recipient).await?;
        Ok(consent_list
            .consents
            .iter()
            .any(|consent| consent.username == sender))
    }

    async fn get_endpoints(&self, username: &str) -> Result<Vec<PushEndpoint>> {
        Ok(self.get_endpoint_list(username).await?.endpoints)
    }

    async fn health_check(&self) -> Result<()> {
        self.get_user_auth(HEALTH_CHECK_USER)
            .await
            .map(|_| ())
            .context("health check failed")
    }
}
