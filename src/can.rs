//! Content-addressable-network gateway client.
//!
//! Publishes the server's signed contact record and keeps it fresh under a
//! monotonically increasing IPNS-style sequence number. The sequence is
//! read-then-incremented under the settings lock; a lost increment is
//! harmless, a regression never happens. Disabled entirely when no gateway
//! endpoint is configured.

use crate::context::ServerContext;
use crate::error::{ServerError, ServerResult};
use crate::net::framing::{read_frame, write_frame};
use crate::proto::can::{
    can_envelope, can_request, CanEnvelope, CanRequest, CanResponse, CanStatus, ContactRecord,
    DeleteObjectRequest, RefreshRecordRequest, SignedContactRecord,
};
use crate::store::{SETTING_CAN_RECORD_HASH, SETTING_IPNS_SEQUENCE};
use crate::types::now;
use prost::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct CanClient {
    endpoint: Option<SocketAddr>,
    /// SettingsLock: serializes singleton writes.
    settings_lock: Mutex<()>,
}

impl CanClient {
    pub fn new(endpoint: Option<SocketAddr>) -> Self {
        Self { endpoint, settings_lock: Mutex::new(()) }
    }

    pub fn enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Re-publish the contact record with the next sequence number.
    pub async fn refresh_contact_record(&self, ctx: &Arc<ServerContext>) -> ServerResult<()> {
        let Some(endpoint) = self.endpoint else { return Ok(()) };

        let sequence = {
            let _settings = self.settings_lock.lock().await;
            let sequence = ctx.store.get_setting_u64(SETTING_IPNS_SEQUENCE)? + 1;
            ctx.store.put_setting_u64(SETTING_IPNS_SEQUENCE, sequence)?;
            sequence
        };

        let record = ContactRecord {
            network_id: ctx.network_id.to_vec(),
            ip_address: ctx.config.server_interface.to_string(),
            primary_port: ctx.config.primary_port as u32,
            timestamp: now(),
        };
        let signature = ctx.keys.sign(&record.encode_to_vec());
        let refresh = can_request::Content::RefreshRecord(RefreshRecordRequest {
            record: Some(SignedContactRecord { record: Some(record), signature }),
            sequence,
        });

        let response = exchange(endpoint, refresh).await?;
        if response.status != CanStatus::Ok as i32 {
            return Err(ServerError::Internal("CAN gateway rejected the refresh".into()));
        }
        if !response.hash.is_empty() {
            let _settings = self.settings_lock.lock().await;
            ctx.store.put_setting(SETTING_CAN_RECORD_HASH, &response.hash)?;
        }
        debug!("Contact record refreshed (sequence {sequence})");
        Ok(())
    }

    /// Retire the published record; used during clean shutdown.
    pub async fn delete_record(&self, ctx: &Arc<ServerContext>) {
        let Some(endpoint) = self.endpoint else { return };
        let Ok(Some(hash)) = ctx.store.get_setting(SETTING_CAN_RECORD_HASH) else { return };

        let delete = can_request::Content::DeleteObject(DeleteObjectRequest { hash });
        match exchange(endpoint, delete).await {
            Ok(response) if response.status == CanStatus::Ok as i32 => {
                info!("Contact record retired from the CAN gateway");
            }
            Ok(_) => warn!("CAN gateway refused to delete the contact record"),
            Err(e) => warn!("Failed to retire contact record: {e}"),
        }
    }
}

/// One request/response exchange over a fresh connection.
async fn exchange(
    endpoint: SocketAddr,
    content: can_request::Content,
) -> ServerResult<CanResponse> {
    let stream = TcpStream::connect(endpoint).await?;
    let (mut reader, mut writer) = tokio::io::split(stream);

    let envelope = CanEnvelope {
        id: 1,
        body: Some(can_envelope::Body::Request(CanRequest { content: Some(content) })),
    };
    write_frame(&mut writer, &envelope.encode_to_vec())
        .await
        .map_err(|e| ServerError::Io(std::io::Error::other(e)))?;

    let payload = read_frame(&mut reader)
        .await
        .map_err(|e| ServerError::Io(std::io::Error::other(e)))?;
    let envelope = CanEnvelope::decode(payload.as_slice())?;
    match envelope.body {
        Some(can_envelope::Body::Response(response)) => Ok(response),
        _ => Err(ServerError::Protocol("unexpected CAN gateway reply".into())),
    }
}
