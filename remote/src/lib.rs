#![deny(unsafe_op_in_unsafe_fn)]

//! HTTP bridge exposing the kernel's introspection surface to an
//! out-of-process debugger. Requests are relayed over the [`DebugProxy`]
//! channel pair; the emulator thread answers whenever it polls
//! `Kernel::service_debug_requests`.

use std::net::IpAddr;

use axum::{
    routing::{get, post},
    Router,
};
use eeos_core::dbg::DebugProxy;
use tokio::net::TcpListener;

mod bridge;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    listenaddr: (IpAddr, u16),
    proxy: DebugProxy,
}

impl ServerOptions {
    pub fn new(listenaddr: (IpAddr, u16), proxy: DebugProxy) -> Self {
        Self { listenaddr, proxy }
    }

    pub fn start(self) {
        use tokio::runtime::Builder;
        let rt = Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .expect("tokio Runtime Builder");
        rt.block_on(async {
            let l = TcpListener::bind(self.listenaddr).await.unwrap();
            let app = Router::new()
                .route("/threads", get(bridge::get_threads))
                .route("/modules", get(bridge::get_modules))
                .route("/status", get(bridge::get_status))
                .route("/idle", get(bridge::get_idle))
                .route("/mem/read", post(bridge::mem_read))
                .with_state(self.proxy);
            axum::serve(l, app).await.unwrap();
        });
    }
}
