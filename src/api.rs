use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub(crate) fn start_api_server(cancel: CancellationToken, listen: String) {
    tokio::spawn(async move {
        let app = Router::new().nest("/record", crate::handler::record::record_router());

        let listener = match TcpListener::bind(&listen).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("failed to bind {}: {}", listen, e);
                cancel.cancel();
                return;
            }
        };
        log::info!("API server started on {}", listen);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("Error starting API server: {}", e);
        }
    });
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("Shutting down API server...");
}
