//! Bundled demo addon: ping and echo features plus connection logging.

use xnet_core::{
    Connection, HandlerContext, LifecycleEvent, MAX_PACKET_BUF_SZ, ServerHandle, XnetError,
};

/// Responds with status `0` and no body.
pub const OPCODE_PING: usize = 1;
/// Reads one length-prefixed field and sends it back.
pub const OPCODE_ECHO: usize = 7;

const STATUS_OK: u16 = 0;

fn ping(ctx: &mut HandlerContext<'_>) -> Result<(), XnetError> {
    ctx.respond(STATUS_OK, None)
}

fn echo(ctx: &mut HandlerContext<'_>) -> Result<(), XnetError> {
    let payload = ctx.read_field(MAX_PACKET_BUF_SZ)?;
    tracing::debug!(
        slot = ctx.connection().slot(),
        bytes = payload.len(),
        "Echoing payload"
    );
    ctx.respond(STATUS_OK, Some(&payload))
}

fn log_lifecycle(event: LifecycleEvent) -> impl Fn(&ServerHandle, &Connection) + Send + Sync {
    move |server: &ServerHandle, conn: &Connection| {
        tracing::debug!(
            ?event,
            slot = conn.slot(),
            session = ?conn.session_id(),
            active = server.active_connections(),
            "Connection lifecycle"
        );
    }
}

/// Register the addon's features and callbacks.
pub fn install(server: &ServerHandle) -> Result<(), XnetError> {
    server.register_feature(OPCODE_PING, ping)?;
    server.register_feature(OPCODE_ECHO, echo)?;
    server.register_lifecycle_callback(
        LifecycleEvent::Connect,
        log_lifecycle(LifecycleEvent::Connect),
    )?;
    server.register_lifecycle_callback(
        LifecycleEvent::Disconnect,
        log_lifecycle(LifecycleEvent::Disconnect),
    )?;
    tracing::info!(opcodes = ?server.registered_opcodes(), "Demo addon installed");
    Ok(())
}
