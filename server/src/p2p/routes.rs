//! REST endpoints for the overlay network.
//!
//! GET /network/status — node id, listen addresses, state, peer count
//! GET /network/peers — peers this node has connected to

use axum::{extract::State, Json};
use serde::Serialize;

use super::network::NetworkState;
use crate::routes::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct NetworkStatus {
    pub peer_count: usize,
    pub node_id: String,
    pub addresses: Vec<String>,
    pub state: NetworkState,
}

#[derive(Debug, Serialize)]
pub struct PeerInfo {
    pub id: String,
    pub addresses: Vec<String>,
}

/// GET /network/status
pub async fn network_status(State(state): State<AppState>) -> Json<ApiResponse<NetworkStatus>> {
    let network = &state.network;
    let addresses = network
        .dialable_addrs()
        .await
        .iter()
        .map(|a| a.to_string())
        .collect();

    ApiResponse::ok(NetworkStatus {
        peer_count: network.peer_count(),
        node_id: network.local_peer_id().to_string(),
        addresses,
        state: network.state(),
    })
}

/// GET /network/peers
pub async fn list_peers(State(state): State<AppState>) -> Json<ApiResponse<Vec<PeerInfo>>> {
    let peers = state
        .network
        .get_peers()
        .into_iter()
        .map(|p| PeerInfo {
            id: p.peer_id.to_string(),
            addresses: p.addrs.iter().map(|a| a.to_string()).collect(),
        })
        .collect();
    ApiResponse::ok(peers)
}
