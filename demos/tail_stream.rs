//! Opens a session, closes the request body immediately, and tails the
//! response until the server finishes.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use syncstream::client::{StreamError, SyncStreamClient};
use syncstream::session::SyncDataHandler;

struct TailHandler {
    ready_tx: mpsc::Sender<()>,
    done_tx: mpsc::Sender<Option<String>>,
}

impl SyncDataHandler for TailHandler {
    fn on_ready(&self) {
        let _ = self.ready_tx.send(());
    }

    fn on_data_received(&self, data: &str) -> bool {
        print!("{data}");
        true
    }

    fn on_finished(&self, error: Option<StreamError>) {
        let _ = self.done_tx.send(error.map(|error| error.to_string()));
    }
}

fn main() {
    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://127.0.0.1:8080/v1/sync".to_string());

    let (ready_tx, ready_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();
    let handler = Arc::new(TailHandler { ready_tx, done_tx });

    let client = SyncStreamClient::new(SecretString::new("REPLACE_WITH_TOKEN".to_string()));
    let session = client.start_streaming(url, handler);

    // Nothing to upload: end the request body as soon as the head is out.
    if ready_rx.recv_timeout(Duration::from_secs(10)).is_ok() {
        session.stop_streaming();
    }

    match done_rx.recv_timeout(Duration::from_secs(60)) {
        Ok(None) => println!("\nstream ended"),
        Ok(Some(error)) => eprintln!("\nstream failed: {error}"),
        Err(_) => eprintln!("\ngave up waiting for the stream to end"),
    }
}
