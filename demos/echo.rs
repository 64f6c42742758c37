//! A minimal gateway-contract application used by `main.rs` and for manual
//! exercising of the server: responds `200 OK` with a short JSON body
//! describing the request, draining the request body first so pipelined
//! clients behave correctly.

use bytes::Bytes;
use gasket::{BoxFuture, Environment, RequestEvent, ResponseEvent, Scope};

pub fn app(scope: Scope, mut receive: gasket::Receiver<'_>, mut send: gasket::Sender<'_>) -> BoxFuture<'_, Result<(), String>> {
    Box::pin(async move {
        let env = match scope {
            Scope::Http(env) => env,
            Scope::Lifespan(_) => return handle_lifespan(receive, send).await,
        };
        drain_body(&mut receive).await;
        respond(&env, &mut send).await;
        Ok(())
    })
}

async fn drain_body(receive: &mut gasket::Receiver<'_>) {
    loop {
        match receive().await {
            RequestEvent::Http { more_body, .. } if !more_body => break,
            RequestEvent::Http { .. } => continue,
            _ => break,
        }
    }
}

async fn respond(env: &Environment, send: &mut gasket::Sender<'_>) {
    let body = format!(
        "{{\"method\":\"{}\",\"path\":\"{}\"}}",
        String::from_utf8_lossy(&env.method),
        env.path
    );
    let body = Bytes::from(body.into_bytes());

    send(ResponseEvent::Start {
        status: 200,
        headers: vec![(Bytes::from_static(b"content-type"), Bytes::from_static(b"application/json"))],
    })
    .await;
    send(ResponseEvent::Body { body, more_body: false }).await;
}

async fn handle_lifespan(mut receive: gasket::Receiver<'_>, mut send: gasket::Sender<'_>) -> Result<(), String> {
    loop {
        match receive().await {
            RequestEvent::LifespanStartup => {
                send(ResponseEvent::LifespanStartupComplete { failed: None }).await;
            }
            RequestEvent::LifespanShutdown => {
                send(ResponseEvent::LifespanShutdownComplete { failed: None }).await;
                return Ok(());
            }
            RequestEvent::Http { .. } => {}
        }
    }
}
