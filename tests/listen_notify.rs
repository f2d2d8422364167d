use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Config, NoTls, Notification};
use ulid::Ulid;

use parkd::campus::CampusManager;
use parkd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<CampusManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("parkd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let cm = Arc::new(CampusManager::new(dir, 1000));

    let cm2 = cm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let cm = cm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, cm, "parkd".to_string(), None).await;
            });
        }
    });

    (addr, cm)
}

async fn connect(
    addr: SocketAddr,
) -> (
    tokio_postgres::Client,
    mpsc::UnboundedReceiver<Notification>,
) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("test")
        .user("parkd")
        .password("parkd");

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (client, rx)
}

/// Wait for a notification with timeout.
async fn recv_notification(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    timeout: Duration,
) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

/// Notification delivery rides the query loop: queued events are flushed
/// ahead of the next response on the subscribing connection. A throwaway
/// query forces that flush.
async fn poll_notifications(client: &tokio_postgres::Client) {
    client.simple_query("SELECT * FROM sites").await.unwrap();
}

/// Create a site, a building with three slots, and return the building id.
async fn setup_building(client: &tokio_postgres::Client) -> Ulid {
    let sid = Ulid::new();
    let bid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO sites (id, name, lat, lng, category) VALUES ('{sid}', 'main lot', 35.68, 139.76, 'parking')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO buildings (id, site_id, name) VALUES ('{bid}', '{sid}', 'garage A')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO slots (building_id, floor, zone, seq, vehicle) VALUES ('{bid}', '1F', 'A', 1, 'normal'), ('{bid}', '1F', 'A', 2, 'normal'), ('{bid}', '1F', 'A', 3, 'ev')"
        ))
        .await
        .unwrap();
    bid
}

const HOUR: i64 = 3_600_000;

fn insert_reservation_sql(bid: Ulid, user: &str, start: i64, end: i64) -> String {
    format!(
        r#"INSERT INTO reservations ("user", building_id, vehicle, booking, start, "end", floor, zone) VALUES ('{user}', '{bid}', 'normal', 'hourly', {start}, {end}, NULL, 'A')"#
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn connect_and_query() {
    let (addr, _cm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    // Create a site and verify the query succeeds
    let sid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO sites (id, name) VALUES ('{sid}', 'east campus')"
        ))
        .await
        .unwrap();

    // Query it back
    let rows = client.simple_query("SELECT * FROM sites").await.unwrap();

    // Should have at least one data row + command complete
    assert!(!rows.is_empty());
}

#[tokio::test]
async fn insert_reservation_returns_row() {
    let (addr, _cm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let bid = setup_building(&client).await;

    let messages = client
        .simple_query(&insert_reservation_sql(bid, "kim", HOUR, 2 * HOUR))
        .await
        .unwrap();

    // The created reservation comes back as a data row with the
    // server-generated id and a pending status.
    let row = messages
        .iter()
        .find_map(|m| match m {
            tokio_postgres::SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .expect("expected a data row");
    let id: &str = row.get("id").unwrap();
    assert!(Ulid::from_string(id).is_ok());
    assert_eq!(row.get("status"), Some("pending"));
    assert_eq!(row.get("booking"), Some("hourly"));
}

#[tokio::test]
async fn overlapping_slot_claim_is_conflict() {
    let (addr, _cm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let bid = setup_building(&client).await;

    let explicit = |user: &str| {
        format!(
            r#"INSERT INTO reservations ("user", building_id, vehicle, booking, start, "end", floor, zone, slot) VALUES ('{user}', '{bid}', 'normal', 'hourly', {HOUR}, {}, NULL, NULL, '1F-A-001')"#,
            2 * HOUR
        )
    };
    client.batch_execute(&explicit("kim")).await.unwrap();

    // Same slot, same window: exclusion violation
    let err = client
        .batch_execute(&explicit("lee"))
        .await
        .expect_err("slot already claimed, insert should fail");
    assert_eq!(
        err.code(),
        Some(&tokio_postgres::error::SqlState::EXCLUSION_VIOLATION)
    );
}

#[tokio::test]
async fn exhausted_zone_is_not_a_conflict() {
    let (addr, _cm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let bid = setup_building(&client).await;

    // Two normal slots in zone A, so two overlapping bookings fit
    // and the third finds the zone full.
    for user in ["kim", "lee"] {
        client
            .batch_execute(&insert_reservation_sql(bid, user, HOUR, 2 * HOUR))
            .await
            .unwrap();
    }
    let err = client
        .batch_execute(&insert_reservation_sql(bid, "park", HOUR, 2 * HOUR))
        .await
        .expect_err("zone is full, insert should fail");
    assert_eq!(
        err.code(),
        Some(&tokio_postgres::error::SqlState::RAISE_EXCEPTION)
    );
}

#[tokio::test]
async fn out_of_range_timestamps_are_rejected() {
    let (addr, _cm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let bid = setup_building(&client).await;

    // A quote with an absurd start must error, not take down the session.
    let err = client
        .batch_execute(&format!(
            "SELECT * FROM quotes WHERE booking = 'flat_24h' AND start = {}",
            i64::MAX - 1
        ))
        .await
        .expect_err("start beyond the valid range");
    assert_eq!(
        err.code(),
        Some(&tokio_postgres::error::SqlState::RAISE_EXCEPTION)
    );

    // Same guard on the read paths that take raw start/end pairs.
    let err = client
        .batch_execute(&format!(
            r#"SELECT * FROM availability WHERE building_id = '{bid}' AND start >= {} AND "end" <= {}"#,
            i64::MIN + 1,
            i64::MAX - 1
        ))
        .await
        .expect_err("span beyond the valid range");
    assert_eq!(
        err.code(),
        Some(&tokio_postgres::error::SqlState::RAISE_EXCEPTION)
    );

    // The connection stays usable afterwards.
    client
        .batch_execute(&insert_reservation_sql(bid, "kim", HOUR, 2 * HOUR))
        .await
        .unwrap();
}

#[tokio::test]
async fn listen_receives_notification() {
    let (addr, _cm) = start_test_server().await;

    // Connection 1: subscriber
    let (client1, mut rx1) = connect(addr).await;
    let bid = setup_building(&client1).await;

    // Subscribe
    client1
        .batch_execute(&format!("LISTEN building_{bid}"))
        .await
        .unwrap();

    // Connection 2: mutator
    let (client2, _rx2) = connect(addr).await;
    client2
        .batch_execute(&insert_reservation_sql(bid, "kim", HOUR, 2 * HOUR))
        .await
        .unwrap();

    // Wait for notification
    poll_notifications(&client1).await;
    let notif = recv_notification(&mut rx1, Duration::from_secs(5)).await;
    assert!(notif.is_some(), "expected notification");
    let notif = notif.unwrap();
    assert_eq!(notif.channel(), &format!("building_{bid}"));
}

#[tokio::test]
async fn notification_payload_is_valid_json() {
    let (addr, _cm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;
    let bid = setup_building(&client1).await;

    client1
        .batch_execute(&format!("LISTEN building_{bid}"))
        .await
        .unwrap();

    let (client2, _) = connect(addr).await;
    client2
        .batch_execute(&insert_reservation_sql(bid, "kim", HOUR, 2 * HOUR))
        .await
        .unwrap();

    poll_notifications(&client1).await;
    let notif = recv_notification(&mut rx1, Duration::from_secs(5))
        .await
        .expect("expected notification");

    // Payload should be valid JSON naming the building and reservation
    let parsed: serde_json::Value = serde_json::from_str(notif.payload())
        .expect("notification payload should be valid JSON");
    assert!(parsed.is_object());
    assert_eq!(parsed["building_id"], bid.to_string());
    assert!(parsed["reservation_id"].is_string());
}

#[tokio::test]
async fn notification_only_on_subscribed_building() {
    let (addr, _cm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;

    let bid_a = setup_building(&client1).await;
    let bid_b = setup_building(&client1).await;

    // Listen only on A
    client1
        .batch_execute(&format!("LISTEN building_{bid_a}"))
        .await
        .unwrap();

    let (client2, _) = connect(addr).await;

    // Book in B, which should NOT trigger a notification
    client2
        .batch_execute(&insert_reservation_sql(bid_b, "kim", HOUR, 2 * HOUR))
        .await
        .unwrap();

    poll_notifications(&client1).await;
    let notif = recv_notification(&mut rx1, Duration::from_millis(500)).await;
    assert!(notif.is_none(), "should not receive notification for unsubscribed building");

    // Book in A, which SHOULD trigger one
    client2
        .batch_execute(&insert_reservation_sql(bid_a, "lee", HOUR, 2 * HOUR))
        .await
        .unwrap();

    poll_notifications(&client1).await;
    let notif = recv_notification(&mut rx1, Duration::from_secs(5)).await;
    assert!(notif.is_some(), "should receive notification for subscribed building");
}

#[tokio::test]
async fn listen_duplicate_is_idempotent() {
    let (addr, _cm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;
    let bid = setup_building(&client1).await;

    // Listen twice on the same channel; should not error
    client1
        .batch_execute(&format!("LISTEN building_{bid}"))
        .await
        .unwrap();
    client1
        .batch_execute(&format!("LISTEN building_{bid}"))
        .await
        .unwrap();

    let (client2, _) = connect(addr).await;
    client2
        .batch_execute(&insert_reservation_sql(bid, "kim", HOUR, 2 * HOUR))
        .await
        .unwrap();

    // Should get exactly one notification (not duplicated)
    poll_notifications(&client1).await;
    let notif1 = recv_notification(&mut rx1, Duration::from_secs(5)).await;
    assert!(notif1.is_some(), "should receive one notification");

    poll_notifications(&client1).await;
    let notif2 = recv_notification(&mut rx1, Duration::from_millis(500)).await;
    assert!(notif2.is_none(), "should not receive duplicate notification");
}

#[tokio::test]
async fn status_change_notifies() {
    let (addr, _cm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;
    let bid = setup_building(&client1).await;

    // Book first so only the status change is in flight once subscribed
    let messages = client1
        .simple_query(&insert_reservation_sql(bid, "kim", HOUR, 2 * HOUR))
        .await
        .unwrap();
    let rid: String = messages
        .iter()
        .find_map(|m| match m {
            tokio_postgres::SimpleQueryMessage::Row(row) => {
                row.get("id").map(|s| s.to_string())
            }
            _ => None,
        })
        .expect("expected reservation id");

    client1
        .batch_execute(&format!("LISTEN building_{bid}"))
        .await
        .unwrap();

    let (client2, _) = connect(addr).await;
    client2
        .batch_execute(&format!(
            "UPDATE reservations SET status = 'confirmed' WHERE id = '{rid}'"
        ))
        .await
        .unwrap();

    poll_notifications(&client1).await;
    let notif = recv_notification(&mut rx1, Duration::from_secs(5))
        .await
        .expect("expected status change notification");
    let parsed: serde_json::Value = serde_json::from_str(notif.payload()).unwrap();
    assert_eq!(parsed["reservation_id"], rid);
    assert_eq!(parsed["status"], "Confirmed");
}

#[tokio::test]
async fn unlisten_stops_notifications() {
    let (addr, _cm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;
    let bid = setup_building(&client1).await;

    client1
        .batch_execute(&format!("LISTEN building_{bid}"))
        .await
        .unwrap();

    // UNLISTEN
    client1
        .batch_execute(&format!("UNLISTEN building_{bid}"))
        .await
        .unwrap();

    let (client2, _) = connect(addr).await;
    client2
        .batch_execute(&insert_reservation_sql(bid, "kim", HOUR, 2 * HOUR))
        .await
        .unwrap();

    poll_notifications(&client1).await;
    let notif = recv_notification(&mut rx1, Duration::from_millis(500)).await;
    assert!(notif.is_none(), "should not receive notification after UNLISTEN");
}

#[tokio::test]
async fn unlisten_all_stops_everything() {
    let (addr, _cm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;

    let bid_a = setup_building(&client1).await;
    let bid_b = setup_building(&client1).await;

    client1
        .batch_execute(&format!("LISTEN building_{bid_a}"))
        .await
        .unwrap();
    client1
        .batch_execute(&format!("LISTEN building_{bid_b}"))
        .await
        .unwrap();

    // UNLISTEN *
    client1.batch_execute("UNLISTEN *").await.unwrap();

    let (client2, _) = connect(addr).await;
    client2
        .batch_execute(&insert_reservation_sql(bid_a, "kim", HOUR, 2 * HOUR))
        .await
        .unwrap();
    client2
        .batch_execute(&insert_reservation_sql(bid_b, "lee", HOUR, 2 * HOUR))
        .await
        .unwrap();

    poll_notifications(&client1).await;
    let notif = recv_notification(&mut rx1, Duration::from_millis(500)).await;
    assert!(notif.is_none(), "should not receive notifications after UNLISTEN *");
}

#[tokio::test]
async fn disconnect_cleans_up() {
    let (addr, _cm) = start_test_server().await;
    let (client1, _rx1) = connect(addr).await;
    let bid = setup_building(&client1).await;

    client1
        .batch_execute(&format!("LISTEN building_{bid}"))
        .await
        .unwrap();

    // Drop the client; the server side must not panic or leak
    drop(client1);
    drop(_rx1);

    // Wait a bit for the server to clean up
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Another connection should still work fine
    let (client2, _) = connect(addr).await;
    client2
        .batch_execute(&insert_reservation_sql(bid, "kim", HOUR, 2 * HOUR))
        .await
        .unwrap();
}

#[tokio::test]
async fn multiple_events_on_same_channel() {
    let (addr, _cm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;
    let bid = setup_building(&client1).await;

    client1
        .batch_execute(&format!("LISTEN building_{bid}"))
        .await
        .unwrap();

    let (client2, _) = connect(addr).await;

    // Three back-to-back bookings in disjoint windows
    for i in 1..=3i64 {
        client2
            .batch_execute(&insert_reservation_sql(
                bid,
                "kim",
                i * HOUR,
                (i + 1) * HOUR,
            ))
            .await
            .unwrap();
    }

    // Should receive all 3 notifications
    poll_notifications(&client1).await;
    let mut count = 0;
    for _ in 0..3 {
        if recv_notification(&mut rx1, Duration::from_secs(5))
            .await
            .is_some()
        {
            count += 1;
        }
    }
    assert_eq!(count, 3, "should receive all 3 notifications");
}

#[tokio::test]
async fn invalid_channel_is_rejected() {
    let (addr, _cm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let err = client
        .batch_execute("LISTEN lobby_chatter")
        .await
        .expect_err("channel without building_ prefix should fail");
    assert!(err.to_string().contains("invalid channel"));
}
