use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpStream,
};
use ulid::Ulid;

use amenityd::scheduler::Scheduler;
use amenityd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("amenityd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let scheduler = Arc::new(Scheduler::new(dir.join("bookings.wal")).unwrap());

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let sched = scheduler.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, sched).await;
            });
        }
    });

    addr
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self { reader: BufReader::new(read_half), writer }
    }

    async fn roundtrip(&mut self, request: Value) -> Value {
        let mut line = serde_json::to_string(&request).unwrap();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();

        let mut response = String::new();
        self.reader.read_line(&mut response).await.unwrap();
        serde_json::from_str(&response).unwrap()
    }
}

async fn create_room(client: &mut Client, building: &str, capacity: u32) -> String {
    let resp = client
        .roundtrip(json!({
            "op": "create_resource",
            "building_id": building,
            "name": "Meeting Room A",
            "kind": "Meeting Room",
            "capacity": capacity,
        }))
        .await;
    assert_eq!(resp["result"], "created");
    let rid = resp["resource_id"].as_str().unwrap().to_string();

    let resp = client
        .roundtrip(json!({
            "op": "replace_windows",
            "resource_id": rid,
            "windows": [{"weekday": 1, "start": "09:00", "end": "10:00", "interval_minutes": 30}],
        }))
        .await;
    assert_eq!(resp["result"], "windows_replaced");
    rid
}

// ── Protocol tests ───────────────────────────────────────────

#[tokio::test]
async fn booking_flow_over_the_wire() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let building = Ulid::new().to_string();
    let rid = create_room(&mut client, &building, 2).await;
    let user = Ulid::new().to_string();

    // Two slots, both empty.
    let resp = client
        .roundtrip(json!({"op": "list_open_slots", "resource_id": rid, "date": "2026-08-03"}))
        .await;
    assert_eq!(resp["result"], "slots");
    let slots = resp["slots"].as_array().unwrap();
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0]["label"], "09:00");
    assert_eq!(slots[0]["booked"], 0);

    // Book, observe occupancy, cancel.
    let resp = client
        .roundtrip(json!({
            "op": "book_slot",
            "resource_id": rid,
            "user_id": user,
            "date": "2026-08-03",
            "start": "09:00",
        }))
        .await;
    assert_eq!(resp["result"], "booked");
    let booking_id = resp["booking_id"].as_str().unwrap().to_string();

    let resp = client
        .roundtrip(json!({"op": "list_open_slots", "resource_id": rid, "date": "2026-08-03"}))
        .await;
    assert_eq!(resp["slots"][0]["booked"], 1);

    let resp = client.roundtrip(json!({"op": "list_bookings", "user_id": user})).await;
    assert_eq!(resp["result"], "bookings");
    let bookings = resp["bookings"].as_array().unwrap();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0]["resource_name"], "Meeting Room A");
    assert_eq!(bookings[0]["status"], "Confirmed");

    let resp = client
        .roundtrip(json!({
            "op": "cancel_booking",
            "booking_id": booking_id,
            "user_id": user,
            "role": "resident",
        }))
        .await;
    assert_eq!(resp["result"], "cancelled");

    let resp = client
        .roundtrip(json!({"op": "list_open_slots", "resource_id": rid, "date": "2026-08-03"}))
        .await;
    assert_eq!(resp["slots"][0]["booked"], 0);
}

#[tokio::test]
async fn slot_full_is_reported_with_code() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let building = Ulid::new().to_string();
    let rid = create_room(&mut client, &building, 1).await;

    let book = |user: String| {
        json!({
            "op": "book_slot",
            "resource_id": rid,
            "user_id": user,
            "date": "2026-08-03",
            "start": "09:30",
        })
    };

    let resp = client.roundtrip(book(Ulid::new().to_string())).await;
    assert_eq!(resp["result"], "booked");

    let resp = client.roundtrip(book(Ulid::new().to_string())).await;
    assert_eq!(resp["result"], "error");
    assert_eq!(resp["code"], "slot_full");
    assert_eq!(resp["retryable"], false);
}

#[tokio::test]
async fn free_form_conflicts_over_the_wire() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let building = Ulid::new().to_string();
    let resp = client
        .roundtrip(json!({
            "op": "create_resource",
            "building_id": building,
            "name": "Tennis Court",
        }))
        .await;
    let rid = resp["resource_id"].as_str().unwrap().to_string();
    client
        .roundtrip(json!({
            "op": "replace_windows",
            "resource_id": rid,
            "windows": [{"weekday": 1, "start": "07:00", "end": "21:00", "interval_minutes": 60}],
        }))
        .await;

    let resp = client
        .roundtrip(json!({
            "op": "book_interval",
            "resource_id": rid,
            "user_id": Ulid::new().to_string(),
            "start": "2026-08-03T14:00:00",
            "end": "2026-08-03T15:00:00",
        }))
        .await;
    assert_eq!(resp["result"], "booked");

    let resp = client
        .roundtrip(json!({
            "op": "book_interval",
            "resource_id": rid,
            "user_id": Ulid::new().to_string(),
            "start": "2026-08-03T13:30:00",
            "end": "2026-08-03T14:30:00",
        }))
        .await;
    assert_eq!(resp["code"], "slot_conflict");

    // Boundary touch books fine.
    let resp = client
        .roundtrip(json!({
            "op": "book_interval",
            "resource_id": rid,
            "user_id": Ulid::new().to_string(),
            "start": "2026-08-03T15:00:00",
            "end": "2026-08-03T16:00:00",
        }))
        .await;
    assert_eq!(resp["result"], "booked");
}

#[tokio::test]
async fn malformed_requests_get_error_responses() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let resp = client.roundtrip(json!({"op": "no_such_op"})).await;
    assert_eq!(resp["result"], "error");
    assert_eq!(resp["code"], "invalid_request");

    // Not even JSON — the connection survives and answers.
    client.writer.write_all(b"not json at all\n").await.unwrap();
    let mut line = String::new();
    client.reader.read_line(&mut line).await.unwrap();
    let resp: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(resp["code"], "invalid_request");

    // Unknown resource comes back as not_found.
    let resp = client
        .roundtrip(json!({
            "op": "list_open_slots",
            "resource_id": Ulid::new().to_string(),
            "date": "2026-08-03",
        }))
        .await;
    assert_eq!(resp["code"], "not_found");
}

#[tokio::test]
async fn concurrent_clients_respect_capacity() {
    let addr = start_test_server().await;
    let mut setup = Client::connect(addr).await;

    let building = Ulid::new().to_string();
    let rid = create_room(&mut setup, &building, 3).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let rid = rid.clone();
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(addr).await;
            let resp = client
                .roundtrip(json!({
                    "op": "book_slot",
                    "resource_id": rid,
                    "user_id": Ulid::new().to_string(),
                    "date": "2026-08-03",
                    "start": "09:00",
                }))
                .await;
            resp["result"] == "booked"
        }));
    }

    let mut accepted = 0;
    for h in handles {
        if h.await.unwrap() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 3);
}
