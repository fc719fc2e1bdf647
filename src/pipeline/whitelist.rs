use super::tcp::TcpConn;
use super::{Handler, PipelineCtx};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// IP whitelist middleware (TCP). If the remote address is substring-
/// contained in the configured allowlist, falls through via `Next`;
/// otherwise writes a short denial message, closes the connection, and
/// aborts the chain.
pub fn whitelist_handler(allowlist: Vec<String>) -> Handler<TcpConn> {
    let allowed = Arc::new(allowlist.join(","));
    Arc::new(move |ctx: &mut PipelineCtx<TcpConn>| {
        let allowed = allowed.clone();
        Box::pin(async move {
            let remote = ctx.conn.peer_addr.ip().to_string();
            if allowed.contains(&remote) {
                ctx.next().await;
                return;
            }

            let _ = ctx.conn.stream.write_all(b"connection rejected: not whitelisted\n").await;
            let _ = ctx.conn.stream.shutdown().await;
            ctx.abort();
        })
    })
}
