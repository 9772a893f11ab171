//! Serves one fake target on 127.0.0.1:9229.
//!
//! Try `curl http://127.0.0.1:9229/json` or open the printed
//! devtools URL. Every protocol request is answered with an empty result.

use jsvm_runtime::inspector::{
    InspectorSocketServer, ServerHandle, ServerOptions, SessionId, SocketServerDelegate,
};

struct DemoDelegate {
    server: Option<ServerHandle>,
}

impl SocketServerDelegate for DemoDelegate {
    fn assign_server(&mut self, server: ServerHandle) {
        self.server = Some(server);
    }

    fn start_session(&mut self, session_id: SessionId, target_id: &str) {
        println!("session {} attached to {}", session_id, target_id);
    }

    fn end_session(&mut self, session_id: SessionId) {
        println!("session {} ended", session_id);
    }

    fn message_received(&mut self, session_id: SessionId, message: &str) {
        let id = serde_json::from_str::<serde_json::Value>(message)
            .ok()
            .and_then(|request| request.get("id").cloned());

        if let (Some(id), Some(server)) = (id, &self.server) {
            server.send(session_id, serde_json::json!({ "id": id, "result": {} }).to_string());
        }
    }

    fn get_target_ids(&self) -> Vec<String> {
        vec!["demo-target".to_string()]
    }

    fn get_target_title(&self, _id: &str) -> String {
        "jsvm demo".to_string()
    }

    fn get_target_url(&self, _id: &str) -> String {
        "file:///demo.js".to_string()
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let options = ServerOptions {
        pid: Some(jsvm_runtime::platform::process_id()),
        ..Default::default()
    };
    let mut server = InspectorSocketServer::new(
        Box::new(DemoDelegate { server: None }),
        "127.0.0.1",
        9229,
        options,
        Some(Box::new(std::io::stderr())),
    );

    if let Err(e) = server.start().await {
        eprintln!("inspector failed to start: {}", e);
        std::process::exit(1);
    }

    let handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.terminate_connections();
            handle.stop();
        }
    });

    server.run().await;
    println!("inspector stopped");
}
