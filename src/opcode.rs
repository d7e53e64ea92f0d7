//! Wire opcodes and JSON payload bodies for the client protocol (§6
//! Client-API) and the Gateway<->Game stream protocol (§6 Gateway->Game /
//! Game->Gateway).
//!
//! Every payload is encoded as JSON inside `Envelope::payload` — the same
//! choice the teacher makes for its scenario/config bodies. Response ops
//! follow `request op + 1` uniformly (§C.2); opcodes below are grouped in
//! pairs accordingly.

use serde::{Deserialize, Serialize};

pub mod client {
    pub const AUTH_REQ: u32 = 10;
    pub const AUTH_RES: u32 = 11;
    pub const RECONNECT_REQ: u32 = 12;
    pub const RECONNECT_RES: u32 = 13;
    pub const GET_ROLES_REQ: u32 = 14;
    pub const GET_ROLES_RES: u32 = 15;
    pub const CREATE_ROLE_REQ: u32 = 16;
    pub const CREATE_ROLE_RES: u32 = 17;
    pub const SELECT_ROLE_REQ: u32 = 18;
    pub const SELECT_ROLE_RES: u32 = 19;
    pub const KICK_NOTICE: u32 = 20;
    pub const LOGIN_REQ: u32 = 21;
    pub const LOGIN_RES: u32 = 22;
}

pub mod backend {
    pub const GATEWAY_FORWARD_MESSAGE: u32 = 100;
    pub const GATEWAY_PLAYER_ONLINE: u32 = 101;
    pub const GATEWAY_PLAYER_OFFLINE: u32 = 102;
    pub const GATEWAY_HEARTBEAT: u32 = 103;
    pub const GAME_SEND_TO_CLIENT: u32 = 110;
    pub const GAME_BROADCAST: u32 = 111;
    pub const GAME_KICK_CLIENT: u32 = 112;
    pub const GAME_HEARTBEAT_ACK: u32 = 113;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthReq {
    pub login_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthRes {
    pub code: u16,
    pub token: String,
    pub uid: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReconnectReq {
    pub session_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReconnectRes {
    pub code: u16,
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoleSummary {
    pub role_id: i64,
    pub nickname: String,
    pub gender: u8,
    pub appearance: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetRolesRes {
    pub code: u16,
    pub roles: Vec<RoleSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRoleReq {
    pub nickname: String,
    pub gender: u8,
    pub appearance: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRoleRes {
    pub code: u16,
    pub role: Option<RoleSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SelectRoleReq {
    pub role_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SelectRoleRes {
    pub code: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KickNotice {
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginReq {
    pub login_type: String,
    pub credentials: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginRes {
    pub code: u16,
    pub token: String,
    pub uid: i64,
    pub nickname: String,
    pub gateway_addr: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GatewayForwardMessage {
    pub role_id: i64,
    pub session_id: String,
    pub client_op: u32,
    pub client_payload: Vec<u8>,
    pub gateway_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GatewayPlayerOnline {
    pub role_id: i64,
    pub uid: i64,
    pub session_id: String,
    pub gateway_id: String,
    pub zone_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GatewayPlayerOffline {
    pub role_id: i64,
    pub session_id: String,
    pub gateway_id: String,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GatewayHeartbeat {
    pub gateway_id: String,
    pub timestamp: i64,
    pub online_count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GameSendToClient {
    pub role_id: i64,
    pub op: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GameBroadcast {
    #[serde(default)]
    pub role_ids: Vec<i64>,
    pub op: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GameKickClient {
    pub role_id: i64,
    pub reason: String,
    pub message: String,
}
