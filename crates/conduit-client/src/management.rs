// Management node: entity metadata requests over the `$management` channel.
use crate::channel::RequestResponseChannel;
use crate::error::{ConduitError, ConduitResult};
use crate::processor::ResourceProcessor;
use bytes::Bytes;
use conduit_wire::{Message, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MANAGEMENT_NODE: &str = "$management";
pub const READ_OPERATION: &str = "READ";
const ENTITY_TYPE: &str = "com.conduit:eventhub";
const PARTITION_TYPE: &str = "com.conduit:partition";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EntityProperties {
    pub name: String,
    #[serde(default)]
    pub created_at: Option<String>,
    pub partition_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PartitionProperties {
    pub entity: String,
    pub id: String,
    pub beginning_sequence_number: i64,
    pub last_enqueued_sequence_number: i64,
    #[serde(default)]
    pub last_enqueued_offset: Option<String>,
    #[serde(default)]
    pub last_enqueued_time_utc: Option<i64>,
    #[serde(default)]
    pub is_empty: bool,
}

/// Thin request builder over a cached management channel.
#[derive(Clone)]
pub struct ManagementNode {
    channels: ResourceProcessor<RequestResponseChannel>,
}

impl ManagementNode {
    pub fn new(channels: ResourceProcessor<RequestResponseChannel>) -> Self {
        Self { channels }
    }

    /// Send `operation` with `properties` and return the successful response.
    pub async fn request(
        &self,
        operation: &str,
        properties: BTreeMap<String, Value>,
    ) -> ConduitResult<Message> {
        let mut request = Message::new(Bytes::new()).with_property("operation", operation);
        request.application_properties.extend(properties);
        let channel = self.channels.subscribe().await?;
        channel.send_with_ack(request).await
    }

    pub async fn entity_properties(&self, entity: &str) -> ConduitResult<EntityProperties> {
        let response = self
            .request(READ_OPERATION, read_properties(ENTITY_TYPE, entity, None))
            .await?;
        decode_body(&response)
    }

    pub async fn partition_properties(
        &self,
        entity: &str,
        partition: &str,
    ) -> ConduitResult<PartitionProperties> {
        let response = self
            .request(
                READ_OPERATION,
                read_properties(PARTITION_TYPE, entity, Some(partition)),
            )
            .await?;
        decode_body(&response)
    }
}

fn read_properties(
    entity_type: &str,
    entity: &str,
    partition: Option<&str>,
) -> BTreeMap<String, Value> {
    let mut properties = BTreeMap::new();
    properties.insert("type".to_string(), Value::from(entity_type));
    properties.insert("name".to_string(), Value::from(entity));
    if let Some(partition) = partition {
        properties.insert("partition".to_string(), Value::from(partition));
    }
    properties
}

fn decode_body<T: serde::de::DeserializeOwned>(response: &Message) -> ConduitResult<T> {
    serde_json::from_slice(&response.body)
        .map_err(|err| ConduitError::InvalidResponse(format!("management response: {err}")))
}
