use axum::{extract::State, http::StatusCode, Json};
use eeos_core::dbg::{Bytes, DebugCommands, DebugProxy, ModuleInfo, ThreadInfo};
use log::error;
use serde::Deserialize;

pub(crate) async fn get_threads(
    State(state): State<DebugProxy>,
) -> (StatusCode, Json<Vec<ThreadInfo>>) {
    let tx = state.dbg_tx;
    let rx = state.dbg_rx;
    tx.send(DebugCommands::Threads(Vec::new())).unwrap();
    if let Ok(DebugCommands::Threads(infos)) = rx.recv() {
        (StatusCode::OK, Json(infos))
    } else {
        error!(target: "remote", "get_threads fail");
        (StatusCode::INTERNAL_SERVER_ERROR, Json(Vec::new()))
    }
}

pub(crate) async fn get_modules(
    State(state): State<DebugProxy>,
) -> (StatusCode, Json<Vec<ModuleInfo>>) {
    let tx = state.dbg_tx;
    let rx = state.dbg_rx;
    tx.send(DebugCommands::Modules(Vec::new())).unwrap();
    if let Ok(DebugCommands::Modules(infos)) = rx.recv() {
        (StatusCode::OK, Json(infos))
    } else {
        error!(target: "remote", "get_modules fail");
        (StatusCode::INTERNAL_SERVER_ERROR, Json(Vec::new()))
    }
}

pub(crate) async fn get_status(State(state): State<DebugProxy>) -> (StatusCode, String) {
    let tx = state.dbg_tx;
    let rx = state.dbg_rx;
    tx.send(DebugCommands::Status(String::new())).unwrap();
    if let Ok(DebugCommands::Status(status)) = rx.recv() {
        (StatusCode::OK, status)
    } else {
        error!(target: "remote", "get_status fail");
        (StatusCode::INTERNAL_SERVER_ERROR, String::with_capacity(0))
    }
}

pub(crate) async fn get_idle(State(state): State<DebugProxy>) -> (StatusCode, Json<Option<bool>>) {
    let tx = state.dbg_tx;
    let rx = state.dbg_rx;
    tx.send(DebugCommands::IsIdle(false)).unwrap();
    if let Ok(DebugCommands::IsIdle(idle)) = rx.recv() {
        (StatusCode::OK, Json(Some(idle)))
    } else {
        error!(target: "remote", "get_idle fail");
        (StatusCode::INTERNAL_SERVER_ERROR, Json(None))
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub(crate) struct MemReadOptions {
    addr: u32,
    size: u32,
}

pub(crate) async fn mem_read(
    State(state): State<DebugProxy>,
    options: Json<MemReadOptions>,
) -> (StatusCode, Vec<u8>) {
    let tx = state.dbg_tx;
    let rx = state.dbg_rx;
    tx.send(DebugCommands::Peek(options.addr, Bytes(options.size)))
        .unwrap();
    if let Ok(DebugCommands::Data(res)) = rx.recv() {
        (StatusCode::OK, res.into_vec())
    } else {
        error!(target: "remote", "mem_read fail");
        (StatusCode::INTERNAL_SERVER_ERROR, Vec::with_capacity(0))
    }
}
