use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use syncstream::client::{StreamError, SyncStreamClient};
use syncstream::session::SyncDataHandler;

struct PrintingHandler {
    ready_tx: mpsc::Sender<()>,
    done_tx: mpsc::Sender<()>,
}

impl SyncDataHandler for PrintingHandler {
    fn on_ready(&self) {
        println!("ready: request head sent, streaming may begin");
        let _ = self.ready_tx.send(());
    }

    fn on_data_received(&self, data: &str) -> bool {
        println!("received: {data}");
        true
    }

    fn on_finished(&self, error: Option<StreamError>) {
        match error {
            Some(error) => eprintln!("finished with error: {error}"),
            None => println!("finished cleanly"),
        }
        let _ = self.done_tx.send(());
    }
}

fn main() {
    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://127.0.0.1:8080/v1/sync".to_string());
    let token = "REPLACE_WITH_TOKEN".to_string();

    let (ready_tx, ready_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();
    let handler = Arc::new(PrintingHandler { ready_tx, done_tx });

    let client = SyncStreamClient::new(SecretString::new(token));
    let session = client.start_streaming(url, handler);

    if ready_rx.recv_timeout(Duration::from_secs(10)).is_ok() {
        for line in ["hello", "from", "syncstream"] {
            if let Err(rejected) = session.write_data(line.as_bytes().to_vec()) {
                eprintln!("write rejected: {rejected}");
            }
        }
        if let Err(rejected) = session.flush() {
            eprintln!("flush rejected: {rejected}");
        }
        session.stop_streaming();
    }

    if done_rx.recv_timeout(Duration::from_secs(30)).is_err() {
        eprintln!("gave up waiting for the session to finish");
    }
}
