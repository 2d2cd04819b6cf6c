//! gRPC NodeService
//!
//! Every call carries an [`proto::Object`] whose `data` is a JSON document.
//! Callers authenticate with `authorization: <jwt>` metadata, except for
//! `Login` and `CreateNode` which carry their own credentials.

use crate::auth::{bearer, Authenticator, Caller};
use crate::enrollment::Enrollment;
use crate::hosts::{HostManager, NodeUpdate};
use crate::state::StateManager;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info};
use uuid::Uuid;
use wgmesh_common::{peers, Error, Host, Node};

pub mod proto {
    #![allow(clippy::all)]

    /// Generic envelope for NodeService calls
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Object {
        #[prost(string, tag = "1")]
        pub data: String,
        #[prost(string, tag = "2")]
        pub key: String,
        #[prost(string, tag = "3")]
        pub r#type: String,
    }

    include!(concat!(env!("OUT_DIR"), "/wgmesh.v1.NodeService.rs"));
}

use proto::node_service_server::{NodeService, NodeServiceServer};
use proto::Object;

const TYPE_JSON: &str = "json";
const TYPE_STRING: &str = "string";

#[derive(Debug, Deserialize)]
struct LoginRequest {
    host_id: Uuid,
    password: String,
}

#[derive(Debug, Deserialize)]
struct CreateNodeRequest {
    token: String,
    host: Host,
}

pub struct NodeServiceImpl {
    state: StateManager,
    auth: Authenticator,
    enrollment: Enrollment,
    hosts: HostManager,
}

impl NodeServiceImpl {
    pub fn new(
        state: StateManager,
        auth: Authenticator,
        enrollment: Enrollment,
        hosts: HostManager,
    ) -> Self {
        Self {
            state,
            auth,
            enrollment,
            hosts,
        }
    }

    fn caller<T>(&self, request: &Request<T>) -> Result<Caller, Status> {
        let value = request
            .metadata()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Status::unauthenticated("missing authorization metadata"))?;
        Ok(self.auth.authenticate(bearer(value))?)
    }

    /// The node named by `key`, visible to its own host or an admin
    fn owned_node(&self, caller: &Caller, key: &str) -> Result<Node, Status> {
        let id = parse_id(key)?;
        let node = self.state.get_node(id)?;
        caller.require_host(node.host_id)?;
        Ok(node)
    }
}

fn parse_id(key: &str) -> Result<Uuid, Status> {
    key.parse()
        .map_err(|_| Status::invalid_argument(format!("invalid node id {:?}", key)))
}

fn decode<T: DeserializeOwned>(object: &Object) -> Result<T, Status> {
    serde_json::from_str(&object.data)
        .map_err(|e| Status::invalid_argument(format!("malformed request data: {}", e)))
}

fn json<T: Serialize>(value: &T) -> Result<Response<Object>, Status> {
    let data = serde_json::to_string(value).map_err(Error::from)?;
    Ok(Response::new(Object {
        data,
        key: String::new(),
        r#type: TYPE_JSON.to_string(),
    }))
}

#[tonic::async_trait]
impl NodeService for NodeServiceImpl {
    async fn login(&self, request: Request<Object>) -> Result<Response<Object>, Status> {
        let req: LoginRequest = decode(request.get_ref())?;
        debug!("gRPC login for host {}", req.host_id);
        let token = self.enrollment.host_token(req.host_id, &req.password)?;
        Ok(Response::new(Object {
            data: token,
            key: req.host_id.to_string(),
            r#type: TYPE_STRING.to_string(),
        }))
    }

    async fn read_node(&self, request: Request<Object>) -> Result<Response<Object>, Status> {
        let caller = self.caller(&request)?;
        let node = self.owned_node(&caller, &request.get_ref().key)?;
        json(&node)
    }

    async fn create_node(&self, request: Request<Object>) -> Result<Response<Object>, Status> {
        let req: CreateNodeRequest = decode(request.get_ref())?;
        let response = self.enrollment.register_with_key(&req.token, req.host).await?;
        json(&response)
    }

    async fn update_node(&self, request: Request<Object>) -> Result<Response<Object>, Status> {
        let caller = self.caller(&request)?;
        let object = request.into_inner();
        let node = self.owned_node(&caller, &object.key)?;
        let update: NodeUpdate = decode(&object)?;
        json(&self.hosts.update_node(node.id, update)?)
    }

    async fn delete_node(&self, request: Request<Object>) -> Result<Response<Object>, Status> {
        let caller = self.caller(&request)?;
        let node = self.owned_node(&caller, &request.get_ref().key)?;
        json(&self.hosts.leave_network(node.host_id, &node.network)?)
    }

    async fn get_peers(&self, request: Request<Object>) -> Result<Response<Object>, Status> {
        let caller = self.caller(&request)?;
        let node = self.owned_node(&caller, &request.get_ref().key)?;
        let snapshot = self.state.snapshot()?;
        json(&peers::compute_peers(&snapshot, node.id))
    }

    async fn get_ext_peers(&self, request: Request<Object>) -> Result<Response<Object>, Status> {
        let caller = self.caller(&request)?;
        let node = self.owned_node(&caller, &request.get_ref().key)?;
        if !node.is_ingress {
            return Err(Status::failed_precondition("node is not an ingress gateway"));
        }
        let snapshot = self.state.snapshot()?;
        json(&peers::compute_ext_peers(&snapshot, node.id))
    }
}

/// Serve NodeService on `addr` until `shutdown` fires
pub async fn serve(
    addr: SocketAddr,
    service: NodeServiceImpl,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!("gRPC server listening on {}", addr);

    tonic::transport::Server::builder()
        .add_service(NodeServiceServer::new(service))
        .serve_with_shutdown(addr, shutdown.cancelled_owned())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrollment::tests::{fixture, Fixture};
    use crate::enrollment_keys::{tokenize, KeyRequest};
    use tonic::metadata::MetadataValue;
    use wgmesh_common::RegisterResponse;

    fn object(key: &str, data: &str) -> Object {
        Object {
            data: data.to_string(),
            key: key.to_string(),
            r#type: TYPE_JSON.to_string(),
        }
    }

    fn authorized(token: &str, object: Object) -> Request<Object> {
        let mut request = Request::new(object);
        let value: MetadataValue<_> = format!("Bearer {}", token).parse().unwrap();
        request.metadata_mut().insert("authorization", value);
        request
    }

    fn service(fx: &Fixture) -> NodeServiceImpl {
        let auth = Authenticator::new(fx.jwt.clone(), fx.users.clone(), None);
        NodeServiceImpl::new(
            fx.state.clone(),
            auth,
            fx.enrollment.clone(),
            fx.hosts.clone(),
        )
    }

    /// Registers a host with a fresh key and returns it with its password
    async fn enroll(fx: &Fixture, svc: &NodeServiceImpl) -> (RegisterResponse, String) {
        let key = fx
            .keys
            .create(
                KeyRequest {
                    networks: vec!["skynet".into()],
                    uses_remaining: 1,
                    ..Default::default()
                },
                "https://api.example.com",
            )
            .unwrap();
        let token = tokenize(&key.value, "https://api.example.com").unwrap();

        let password = "host-secret-1".to_string();
        let host = serde_json::json!({
            "id": Uuid::new_v4(),
            "name": "edge-1",
            "public_key": wgmesh_common::crypto::generate_wireguard_keypair().public_key,
            "host_pass": password,
        });
        let data = serde_json::json!({ "token": token, "host": host }).to_string();
        let reply = svc.create_node(Request::new(object("", &data))).await.unwrap();
        (serde_json::from_str(&reply.into_inner().data).unwrap(), password)
    }

    #[tokio::test]
    async fn test_create_node_and_login() {
        let fx = fixture(true);
        let svc = service(&fx);
        let (registered, password) = enroll(&fx, &svc).await;
        let host_id = registered.requested_host.id;
        assert_eq!(fx.state.nodes_of_host(host_id).unwrap().len(), 1);

        let login = serde_json::json!({ "host_id": host_id, "password": password }).to_string();
        let reply = svc.login(Request::new(object("", &login))).await.unwrap().into_inner();
        assert_eq!(reply.r#type, TYPE_STRING);
        assert!(!reply.data.is_empty());

        let bad = serde_json::json!({ "host_id": host_id, "password": "nope" }).to_string();
        let err = svc.login(Request::new(object("", &bad))).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);
    }

    #[tokio::test]
    async fn test_node_calls_require_owner() {
        let fx = fixture(true);
        let svc = service(&fx);
        let (registered, password) = enroll(&fx, &svc).await;
        let host_id = registered.requested_host.id;
        let node = fx.state.nodes_of_host(host_id).unwrap().remove(0);
        let token = svc.enrollment.host_token(host_id, &password).unwrap();

        let err = svc
            .read_node(Request::new(object(&node.id.to_string(), "")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);

        let reply = svc
            .read_node(authorized(&token, object(&node.id.to_string(), "")))
            .await
            .unwrap()
            .into_inner();
        let read: Node = serde_json::from_str(&reply.data).unwrap();
        assert_eq!(read.id, node.id);

        let other = fx.jwt.issue(&crate::auth::Claims::for_host(Uuid::new_v4())).unwrap();
        let err = svc
            .read_node(authorized(&other, object(&node.id.to_string(), "")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::PermissionDenied);
    }

    #[tokio::test]
    async fn test_update_peers_and_delete() {
        let fx = fixture(true);
        let svc = service(&fx);
        let (registered, password) = enroll(&fx, &svc).await;
        let host_id = registered.requested_host.id;
        let node = fx.state.nodes_of_host(host_id).unwrap().remove(0);
        let token = svc.enrollment.host_token(host_id, &password).unwrap();
        let key = node.id.to_string();

        let update = serde_json::json!({ "persistent_keepalive": 15 }).to_string();
        let reply = svc
            .update_node(authorized(&token, object(&key, &update)))
            .await
            .unwrap()
            .into_inner();
        let updated: Node = serde_json::from_str(&reply.data).unwrap();
        assert_eq!(updated.persistent_keepalive, Some(15));

        let reply = svc.get_peers(authorized(&token, object(&key, ""))).await.unwrap();
        assert_eq!(reply.get_ref().r#type, TYPE_JSON);

        let err = svc
            .get_ext_peers(authorized(&token, object(&key, "")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);

        svc.delete_node(authorized(&token, object(&key, ""))).await.unwrap();
        assert!(fx.state.nodes_of_host(host_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_data_is_invalid_argument() {
        let fx = fixture(true);
        let svc = service(&fx);
        let err = svc.create_node(Request::new(object("", "{not json"))).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }
}
