//! Contract with the remote control plane.
//!
//! This module defines the `CloudApi` trait that the engine drives, the
//! value types exchanged with it, and `ApiError`, the failure type every
//! call returns. The engine never speaks HTTP itself; a generated client (or
//! the in-memory `MockCloud` used by tests) implements `CloudApi`.

use std::fmt;

use async_trait::async_trait;
use converge_core::{OperationId, ResourceId, ResourceKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::operation::OperationHandle;

/// A result type using `ApiError`.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Operations the engine needs from the remote API client.
///
/// Every mutating call returns an [`OperationHandle`] that must be tracked
/// to completion before the change can be relied upon.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Submit a create, update, resize or delete mutation.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is rejected or never reaches the API.
    async fn submit_mutation(&self, request: &MutationRequest) -> ApiResult<OperationHandle>;

    /// Fetch the current state of an operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation cannot be fetched.
    async fn refetch_operation(&self, id: OperationId) -> ApiResult<OperationHandle>;

    /// List the current members of a relationship.
    ///
    /// # Errors
    ///
    /// Returns an error if the owner does not exist or the call fails.
    async fn list_members(&self, relation: Relation, owner: ResourceId) -> ApiResult<Vec<Member>>;

    /// List members that could be attached under `group` without conflict.
    ///
    /// For keyed relations `group` is the key (e.g. the network an address
    /// must belong to).
    ///
    /// # Errors
    ///
    /// Returns an error if the group does not exist or the call fails.
    async fn list_available(
        &self,
        relation: Relation,
        group: ResourceId,
    ) -> ApiResult<Vec<ResourceId>>;

    /// Attach a member to an owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the attach request is rejected.
    async fn attach_member(
        &self,
        relation: Relation,
        owner: ResourceId,
        member: Member,
    ) -> ApiResult<OperationHandle>;

    /// Detach a member from an owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the detach request is rejected.
    async fn detach_member(
        &self,
        relation: Relation,
        owner: ResourceId,
        member: ResourceId,
    ) -> ApiResult<OperationHandle>;

    /// Read the current remote state of a resource.
    ///
    /// # Errors
    ///
    /// Returns a 404 `ApiError::Status` if the resource no longer exists.
    async fn get_resource_state(&self, kind: ResourceKind, id: ResourceId)
        -> ApiResult<ResourceState>;

    /// Power off an instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is rejected.
    async fn power_off(&self, id: ResourceId) -> ApiResult<OperationHandle>;

    /// Power on an instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is rejected.
    async fn power_on(&self, id: ResourceId) -> ApiResult<OperationHandle>;
}

/// Errors returned by a `CloudApi` implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// The API answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Error text returned by the API.
        message: String,
    },

    /// The request or response was cut off below the HTTP layer.
    #[error("transport failure ({fault}): {message}")]
    Transport {
        /// What went wrong on the connection.
        fault: TransportFault,
        /// Underlying error text.
        message: String,
    },

    /// The response arrived but could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Shorthand for a status error.
    #[must_use]
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Shorthand for a transport error.
    #[must_use]
    pub fn transport(fault: TransportFault, message: impl Into<String>) -> Self {
        Self::Transport {
            fault,
            message: message.into(),
        }
    }

    /// The HTTP status carried by this error, if any.
    #[must_use]
    pub const fn http_status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport { .. } | Self::Decode(_) => None,
        }
    }
}

/// Connection-level failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportFault {
    /// The peer closed the connection before the response was complete.
    Eof,
    /// The connection was reset or the pipe broke mid-request.
    ConnectionReset,
    /// The request timed out.
    Timeout,
    /// No connection could be established.
    Connect,
    /// Anything else below the HTTP layer.
    Other,
}

impl fmt::Display for TransportFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eof => "unexpected EOF",
            Self::ConnectionReset => "connection reset",
            Self::Timeout => "timeout",
            Self::Connect => "connect",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::Status {
                status: status.as_u16(),
                message: err.to_string(),
            };
        }

        if err.is_decode() {
            return Self::Decode(err.to_string());
        }

        let fault = if err.is_timeout() {
            TransportFault::Timeout
        } else if err.is_connect() {
            TransportFault::Connect
        } else {
            fault_from_chain(&err)
        };

        Self::Transport {
            fault,
            message: err.to_string(),
        }
    }
}

/// Walk an error's source chain looking for a recognisable connection fault.
pub(crate) fn fault_from_chain(err: &(dyn std::error::Error + 'static)) -> TransportFault {
    use std::io::ErrorKind;

    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            match io.kind() {
                ErrorKind::UnexpectedEof => return TransportFault::Eof,
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe => return TransportFault::ConnectionReset,
                ErrorKind::TimedOut => return TransportFault::Timeout,
                _ => {}
            }
        }

        let text = e.to_string().to_ascii_lowercase();
        if text.contains("eof")
            || text.contains("incomplete message")
            || text.contains("connection closed before message completed")
        {
            return TransportFault::Eof;
        }
        if text.contains("connection reset") || text.contains("broken pipe") {
            return TransportFault::ConnectionReset;
        }

        current = e.source();
    }
    TransportFault::Other
}

/// Many-to-many relationships the engine reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    /// Public IP addresses attached to an instance, keyed by network endpoint.
    InstanceIps,
    /// Network endpoints an instance is connected to.
    InstanceNetworks,
    /// Instances a volume is connected to.
    VolumeConnections,
    /// Instances serving behind a load balancer.
    LoadBalancerMembers,
}

impl Relation {
    /// Kind of the owning resource.
    #[must_use]
    pub const fn owner_kind(self) -> ResourceKind {
        match self {
            Self::InstanceIps | Self::InstanceNetworks => ResourceKind::Instance,
            Self::VolumeConnections => ResourceKind::Volume,
            Self::LoadBalancerMembers => ResourceKind::LoadBalancer,
        }
    }

    /// Kind of the member resources.
    #[must_use]
    pub const fn member_kind(self) -> ResourceKind {
        match self {
            Self::InstanceIps => ResourceKind::IpAddress,
            Self::InstanceNetworks => ResourceKind::NetworkEndpoint,
            Self::VolumeConnections | Self::LoadBalancerMembers => ResourceKind::Instance,
        }
    }

    /// Kind of the key for keyed relations, `None` for plain sets.
    #[must_use]
    pub const fn key_kind(self) -> Option<ResourceKind> {
        match self {
            Self::InstanceIps => Some(ResourceKind::NetworkEndpoint),
            Self::InstanceNetworks | Self::VolumeConnections | Self::LoadBalancerMembers => None,
        }
    }

    /// Returns true if members are addressed by key rather than as a set.
    #[must_use]
    pub const fn is_keyed(self) -> bool {
        self.key_kind().is_some()
    }

    /// Stable name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InstanceIps => "instance-ips",
            Self::InstanceNetworks => "instance-networks",
            Self::VolumeConnections => "volume-connections",
            Self::LoadBalancerMembers => "load-balancer-members",
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One member of a relationship as reported by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    /// Remote id of the member.
    pub id: ResourceId,
    /// Key the member is filed under, for keyed relations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<ResourceId>,
}

impl Member {
    /// A member of a plain set relation.
    #[must_use]
    pub const fn new(id: ResourceId) -> Self {
        Self { id, group: None }
    }

    /// A member of a keyed relation.
    #[must_use]
    pub const fn grouped(id: ResourceId, group: ResourceId) -> Self {
        Self {
            id,
            group: Some(group),
        }
    }
}

/// The kind of change a mutation request performs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MutationAction {
    /// Create a new resource.
    Create,
    /// Update mutable attributes in place.
    Update,
    /// Grow a volume to a new size.
    Resize {
        /// New size in gigabytes.
        size_gb: u64,
    },
    /// Delete the resource.
    Delete,
}

impl MutationAction {
    /// Verb used in log lines and error messages.
    #[must_use]
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::Create => "creating",
            Self::Update => "updating",
            Self::Resize { .. } => "resizing",
            Self::Delete => "deleting",
        }
    }
}

/// A mutation to submit to the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    /// Kind of resource being mutated.
    pub kind: ResourceKind,
    /// Remote id, absent for creates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ResourceId>,
    /// Local name of the resource.
    pub name: String,
    /// What to do.
    pub action: MutationAction,
    /// Attributes to send with the request.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl MutationRequest {
    /// A create request.
    #[must_use]
    pub fn create(kind: ResourceKind, name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            id: None,
            name: name.into(),
            action: MutationAction::Create,
            payload,
        }
    }

    /// A request against an existing resource.
    #[must_use]
    pub fn existing(
        target: &converge_core::Target,
        action: MutationAction,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind: target.kind,
            id: Some(target.id),
            name: target.name.clone(),
            action,
            payload,
        }
    }
}

/// Power state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// The instance is running.
    Running,
    /// The instance is stopped.
    Stopped,
    /// The instance is starting or shutting down.
    Transitioning,
    /// The state could not be determined.
    #[default]
    Unknown,
}

/// Storage class of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskType {
    /// Standard network storage.
    Standard,
    /// SSD-backed storage.
    Ssd,
    /// SSD storage that may be connected to several instances at once.
    SharedSsd,
}

/// Remote state of a resource as returned by `get_resource_state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Remote id.
    pub id: ResourceId,
    /// Kind of resource.
    pub kind: ResourceKind,
    /// Name as stored remotely.
    pub name: String,
    /// Subregion the resource lives in.
    pub subregion: String,
    /// Power state, for instances.
    #[serde(default)]
    pub power: Option<PowerState>,
    /// Size in gigabytes, for volumes.
    #[serde(default)]
    pub size_gb: Option<u64>,
    /// Storage class, for volumes.
    #[serde(default)]
    pub disk_type: Option<DiskType>,
    /// Whether a volume may be connected to more than one instance.
    #[serde(default)]
    pub shared: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn relation_kinds() {
        assert_eq!(Relation::InstanceIps.owner_kind(), ResourceKind::Instance);
        assert_eq!(Relation::InstanceIps.member_kind(), ResourceKind::IpAddress);
        assert!(Relation::InstanceIps.is_keyed());
        assert_eq!(Relation::VolumeConnections.owner_kind(), ResourceKind::Volume);
        assert_eq!(
            Relation::VolumeConnections.member_kind(),
            ResourceKind::Instance
        );
        assert!(!Relation::LoadBalancerMembers.is_keyed());
    }

    #[test]
    fn mutation_request_serializes() {
        let target = converge_core::Target::new(ResourceKind::Volume, "data", ResourceId::new(5));
        let req = MutationRequest::existing(
            &target,
            MutationAction::Resize { size_gb: 40 },
            serde_json::Value::Null,
        );

        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["kind"], "volume");
        assert_eq!(json["id"], 5);
        assert_eq!(json["action"]["type"], "resize");
        assert_eq!(json["action"]["size_gb"], 40);
    }

    #[test]
    fn io_errors_map_to_faults() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "early close");
        assert_eq!(fault_from_chain(&eof), TransportFault::Eof);

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        assert_eq!(fault_from_chain(&reset), TransportFault::ConnectionReset);

        let other = std::io::Error::new(std::io::ErrorKind::Other, "unexpected EOF during handshake");
        assert_eq!(fault_from_chain(&other), TransportFault::Eof);

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(fault_from_chain(&denied), TransportFault::Other);
    }

    #[tokio::test]
    async fn reqwest_status_error_keeps_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/operations/17"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = reqwest::get(format!("{}/v1/operations/17", server.uri()))
            .await
            .unwrap()
            .error_for_status()
            .unwrap_err();

        let api_err = ApiError::from(err);
        assert_eq!(api_err.http_status(), Some(404));
    }

    #[tokio::test]
    async fn reqwest_decode_error_maps_to_decode() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/operations/18"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = reqwest::get(format!("{}/v1/operations/18", server.uri()))
            .await
            .unwrap()
            .json::<OperationHandle>()
            .await
            .unwrap_err();

        assert!(matches!(ApiError::from(err), ApiError::Decode(_)));
    }
}
