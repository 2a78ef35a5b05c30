// ABOUTME: Starts a codec service session and connects a client to it
// ABOUTME: In-process task or child process, with bounded connect retry

use crate::client::default::AvClient;
use crate::client::error::{ClientError, ClientResult};
use crate::codec::PIPE_BUFFER_SIZE;
use crate::service::{serve, ServeError};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info};

const CONNECT_RETRY: Duration = Duration::from_millis(100);
const CONNECT_ATTEMPTS: usize = 20;

/// Handle for a service session running on the current runtime.
pub type ServiceHandle = JoinHandle<Result<(), ServeError>>;

/// Run a service session as a background task of the current runtime.
pub fn start_service(instance_id: &str) -> ServiceHandle {
    let instance_id = instance_id.to_string();
    tokio::spawn(async move { serve(&instance_id, PIPE_BUFFER_SIZE).await })
}

/// Spawn the service binary as a child process for the given instance.
///
/// The child is killed if the handle is dropped without a clean
/// shutdown.
pub fn spawn_service_process(
    program: impl AsRef<std::ffi::OsStr>,
    instance_id: &str,
) -> ClientResult<Child> {
    let child = Command::new(program)
        .arg(instance_id)
        .kill_on_drop(true)
        .spawn()?;
    info!(instance_id, pid = child.id(), "service process spawned");
    Ok(child)
}

/// Start an in-process service session and connect a client to it.
///
/// The service needs a moment to bind its endpoint, so the connect is
/// retried on a short interval before giving up.
pub async fn open_service(instance_id: &str) -> ClientResult<(AvClient, ServiceHandle)> {
    let handle = start_service(instance_id);

    let mut last = ClientError::Closed;
    for attempt in 0..CONNECT_ATTEMPTS {
        match AvClient::connect(instance_id).await {
            Ok(client) => {
                debug!(instance_id, attempt, "connected to service");
                return Ok((client, handle));
            }
            Err(e) => last = e,
        }
        time::sleep(CONNECT_RETRY).await;
    }

    handle.abort();
    Err(last)
}

/// Stop the service and wait for its session to finish.
pub async fn close_service(client: &mut AvClient, handle: ServiceHandle) -> ClientResult<()> {
    client.stop_service().await?;
    let _ = handle.await;
    info!("service session finished");
    Ok(())
}
