//! Command routing.
//!
//! Window-system calls run on the blocking pool and outside the store;
//! only their results are committed through the [`StoreHandle`].

use backtick_ipc::{
    ActivateWindowRequest, GetWindowsRequest, IpcCommand, IpcResponse, StatusResponse, WindowInfo,
};
use backtick_platform::WindowSource;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::store::StoreHandle;

/// Routes parsed commands to the window source and the store.
#[derive(Clone)]
pub struct Dispatcher {
    source: Arc<dyn WindowSource>,
    store: StoreHandle,
}

impl Dispatcher {
    /// Create a dispatcher over a window source and a store handle.
    pub fn new(source: Arc<dyn WindowSource>, store: StoreHandle) -> Self {
        Self { source, store }
    }

    /// Process a command and return a response.
    ///
    /// `Shutdown` only acknowledges; stopping the helper is up to the
    /// connection handler once the reply is written.
    pub async fn handle(&self, cmd: IpcCommand) -> IpcResponse {
        match cmd {
            IpcCommand::GetStatus => {
                let has_permission = self.blocking(|source| source.has_permission()).await;
                match has_permission {
                    Ok(granted) => IpcResponse::Status(StatusResponse {
                        has_accessibility_permission: granted,
                    }),
                    Err(message) => IpcResponse::error(message),
                }
            }
            IpcCommand::RequestPermission => {
                match self.blocking(|source| source.request_permission()).await {
                    Ok(()) => IpcResponse::Ok,
                    Err(message) => IpcResponse::error(message),
                }
            }
            IpcCommand::GetWindows(request) => self.get_windows(request).await,
            IpcCommand::ActivateWindow(request) => self.activate_window(request).await,
            IpcCommand::Shutdown => IpcResponse::Ok,
        }
    }

    async fn get_windows(&self, request: GetWindowsRequest) -> IpcResponse {
        let snapshot = match self.blocking(|source| source.list_windows()).await {
            Ok(snapshot) => snapshot,
            Err(message) => return IpcResponse::error(message),
        };
        debug!("Window source returned {} windows", snapshot.len());

        match self
            .store
            .reconcile(snapshot, request.new_window_position, request.activation_mode)
            .await
        {
            Ok(windows) => IpcResponse::Windows(windows.into_iter().map(WindowInfo::from).collect()),
            Err(e) => IpcResponse::error(e.to_string()),
        }
    }

    async fn activate_window(&self, request: ActivateWindowRequest) -> IpcResponse {
        let id = request.id;
        match self.blocking(move |source| source.activate(id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Activation of window {} failed: {}", id, e);
                return IpcResponse::error(e.to_string());
            }
            Err(message) => return IpcResponse::error(message),
        }

        match self.store.promote(id).await {
            Ok(()) => IpcResponse::Ok,
            Err(e) => IpcResponse::error(e.to_string()),
        }
    }

    /// Run a window-source call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, String>
    where
        T: Send + 'static,
        F: FnOnce(&dyn WindowSource) -> T + Send + 'static,
    {
        let source = Arc::clone(&self.source);
        tokio::task::spawn_blocking(move || f(source.as_ref()))
            .await
            .map_err(|e| format!("Window source call failed: {}", e))
    }
}
