use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use spalloc_core::{
    Controller, ControllerConfig, JobId, JobState, LoggingConnector, Machine, StandardIps,
    default_tags,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};

use crate::server::client::handle_client_connections;
use crate::server::state::ServerState;

const TIMEOUT: Duration = Duration::from_secs(10);

/// A `width` x `height` machine with standard IPs in `10.<index>.0.0/16`.
pub fn test_machine(name: &str, width: u32, height: u32, index: u8) -> Machine {
    let mut locations = BTreeMap::new();
    for x in 0..width {
        for y in 0..height {
            for z in 0..3 {
                locations.insert((x, y, z), (x, y, z));
            }
        }
    }
    let ips = StandardIps {
        base_ip: Ipv4Addr::new(10, index, 0, 0),
        ..Default::default()
    };
    Machine::with_standard_ips(
        name.to_string(),
        default_tags(),
        Some(width),
        Some(height),
        BTreeSet::new(),
        BTreeSet::new(),
        locations,
        &ips,
    )
    .unwrap()
}

pub async fn wait_for_state(controller: &Controller, job_id: JobId, state: JobState) {
    tokio::time::timeout(TIMEOUT, async {
        while controller.get_job_state(job_id, None).state != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job {job_id} did not reach {state}"));
}

pub struct TestServer {
    pub address: SocketAddr,
    pub controller: Controller,
}

impl TestServer {
    pub async fn start(machines: Vec<Machine>) -> Self {
        let controller = Controller::new(
            ControllerConfig {
                max_retired_jobs: 10,
                seconds_before_free: 0.0,
                bmp_retry_delay: Duration::ZERO,
            },
            Arc::new(LoggingConnector),
        );
        controller.set_machines(machines).unwrap();
        controller.changed_jobs();
        controller.changed_machines();

        let state = ServerState::new(controller.clone());
        tokio::spawn(state.clone().forward_changes());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(handle_client_connections(listener, state));
        TestServer {
            address,
            controller,
        }
    }

    pub async fn connect(&self) -> TestClient {
        TestClient::connect(self.address).await
    }
}

pub struct TestClient {
    framed: Framed<TcpStream, LinesCodec>,
}

impl TestClient {
    pub async fn connect(address: SocketAddr) -> Self {
        let socket = TcpStream::connect(address).await.unwrap();
        TestClient {
            framed: Framed::new(socket, LinesCodec::new()),
        }
    }

    pub async fn send_line(&mut self, line: &str) {
        self.framed.send(line).await.unwrap();
    }

    /// Next line from the server, `None` once the connection is closed.
    pub async fn receive(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(TIMEOUT, self.framed.next())
            .await
            .expect("no message from server")?;
        Some(serde_json::from_str(&line.unwrap()).unwrap())
    }

    /// Sends a command and returns the response, skipping notifications.
    pub async fn request(&mut self, command: &str, args: Value, kwargs: Value) -> Value {
        let request = json!({"command": command, "args": args, "kwargs": kwargs});
        self.send_line(&request.to_string()).await;
        loop {
            let message = self.receive().await.expect("connection closed");
            if message.get("return").is_some() || message.get("exception").is_some() {
                return message;
            }
        }
    }

    /// Sends a command which must succeed and returns its value.
    pub async fn call(&mut self, command: &str, args: Value, kwargs: Value) -> Value {
        let mut response = self.request(command, args, kwargs).await;
        match response.get_mut("return") {
            Some(value) => value.take(),
            None => panic!("{command} failed: {response}"),
        }
    }

    pub async fn wait_for_job_state(&mut self, job_id: &Value, state: JobState) -> Value {
        tokio::time::timeout(TIMEOUT, async {
            loop {
                let info = self
                    .call("get_job_state", json!([job_id]), json!({}))
                    .await;
                if info["state"] == json!(state.code()) {
                    return info;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("job {job_id} did not reach {state}"))
    }
}
