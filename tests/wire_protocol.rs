use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use packslot::config::default_offset;
use packslot::tenant::TenantManager;
use packslot::wire::{self, PackslotFactory};

const ADMIN_PASSWORD: &str = "packslot";
const GROWER_PASSWORD: &str = "grower";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("packslot_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, default_offset()));
    let factory = Arc::new(PackslotFactory::new(tm, ADMIN_PASSWORD.to_string()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory, None).await;
            });
        }
    });

    addr
}

async fn try_connect(
    addr: SocketAddr,
    user: &str,
    password: &str,
) -> Result<Client, tokio_postgres::Error> {
    try_connect_to(addr, "test", user, password).await
}

async fn try_connect_to(
    addr: SocketAddr,
    dbname: &str,
    user: &str,
    password: &str,
) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user(user)
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn admin(addr: SocketAddr) -> Client {
    try_connect(addr, "admin", ADMIN_PASSWORD).await.unwrap()
}

async fn grower(addr: SocketAddr, id: Ulid) -> Client {
    try_connect(addr, &format!("grower_{id}"), GROWER_PASSWORD)
        .await
        .unwrap()
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> String {
    err.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_default()
}

/// A grower (logging in with `GROWER_PASSWORD`), a cultivar and one slot of `capacity` on 2031-03-03 08:00.
async fn seed(client: &Client, capacity: u32) -> (Ulid, Ulid, Ulid) {
    let (grower_id, cultivar_id, slot_id) = (Ulid::new(), Ulid::new(), Ulid::new());
    client
        .batch_execute(&format!(
            "INSERT INTO growers (id, name, password) VALUES ('{grower_id}', 'Hill Farm', '{GROWER_PASSWORD}');
             INSERT INTO cultivars (id, name) VALUES ('{cultivar_id}', 'Packham');
             INSERT INTO slots (id, date, start_time, end_time, capacity) \
             VALUES ('{slot_id}', '2031-03-03', '08:00', '09:00', {capacity})"
        ))
        .await
        .unwrap();
    (grower_id, cultivar_id, slot_id)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn health_and_whoami() {
    let addr = start_test_server().await;
    let client = admin(addr).await;

    let health = rows(&client, "SELECT * FROM health").await;
    assert_eq!(health[0].get("status"), Some("ok"));

    let me = rows(&client, "SELECT * FROM whoami").await;
    assert_eq!(me[0].get("role"), Some("admin"));
    assert_eq!(me[0].get("tenant"), Some("test"));
    assert_eq!(me[0].get("grower_id"), None);
}

#[tokio::test]
async fn wrong_password_is_refused() {
    let addr = start_test_server().await;
    assert!(try_connect(addr, "admin", "nope").await.is_err());
    assert!(try_connect(addr, "postgres", ADMIN_PASSWORD).await.is_err());
    let grower_login = format!("grower_{}", Ulid::new());
    assert!(try_connect(addr, &grower_login, ADMIN_PASSWORD).await.is_err());
    assert!(try_connect(addr, &grower_login, GROWER_PASSWORD).await.is_err());
}

#[tokio::test]
async fn grower_logins_use_their_own_password_in_their_own_packhouse() {
    let addr = start_test_server().await;
    let admin_client = admin(addr).await;
    let (hill, _, _) = seed(&admin_client, 10).await;
    let river = Ulid::new();
    admin_client
        .batch_execute(&format!(
            "INSERT INTO growers (id, name, password) VALUES ('{river}', 'River Orchards', 'river-pw')"
        ))
        .await
        .unwrap();
    let (hill_login, river_login) = (format!("grower_{hill}"), format!("grower_{river}"));

    assert!(try_connect(addr, &river_login, "river-pw").await.is_ok());
    assert!(try_connect(addr, &river_login, GROWER_PASSWORD).await.is_err());
    assert!(try_connect(addr, &hill_login, "river-pw").await.is_err());
    assert!(try_connect_to(addr, "other_packhouse", &hill_login, GROWER_PASSWORD).await.is_err());

    // Admins can rotate a grower's password; the old one stops working.
    admin_client
        .batch_execute(&format!(
            "INSERT INTO credentials (login, password) VALUES ('{hill_login}', 'rotated')"
        ))
        .await
        .unwrap();
    assert!(try_connect(addr, &hill_login, GROWER_PASSWORD).await.is_err());
    let hill_client = try_connect(addr, &hill_login, "rotated").await.unwrap();
    let me = rows(&hill_client, "SELECT * FROM whoami").await;
    assert_eq!(me[0].get("grower_id"), Some(hill.to_string().as_str()));

    // Growers can't set credentials, and growers never see password columns.
    let err = hill_client
        .batch_execute(&format!(
            "INSERT INTO credentials (login, password) VALUES ('{river_login}', 'mine')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");
    let growers = rows(&admin_client, "SELECT * FROM growers").await;
    assert!(growers[0].columns().iter().all(|c| c.name() != "password"));
}

#[tokio::test]
async fn packhouse_admin_password_is_per_database() {
    let addr = start_test_server().await;
    let admin_client = admin(addr).await;
    admin_client
        .batch_execute("INSERT INTO credentials (login, password) VALUES ('admin', 'test-gate')")
        .await
        .unwrap();

    assert!(try_connect(addr, "admin", ADMIN_PASSWORD).await.is_err());
    assert!(try_connect(addr, "admin", "test-gate").await.is_ok());
    assert!(try_connect_to(addr, "other_packhouse", "admin", "test-gate").await.is_err());
    assert!(try_connect_to(addr, "other_packhouse", "admin", ADMIN_PASSWORD).await.is_ok());
}

#[tokio::test]
async fn booking_reduces_remaining_capacity() {
    let addr = start_test_server().await;
    let client = admin(addr).await;
    let (grower_id, cultivar_id, slot_id) = seed(&client, 10).await;

    client
        .batch_execute(&format!(
            "INSERT INTO bookings (slot_id, grower_id, cultivar_id, quantity) \
             VALUES ('{slot_id}', '{grower_id}', '{cultivar_id}', 4)"
        ))
        .await
        .unwrap();

    let usage = rows(&client, &format!("SELECT * FROM slot_usage WHERE slot_id = '{slot_id}'")).await;
    assert_eq!(usage[0].get("booked"), Some("4"));
    assert_eq!(usage[0].get("remaining"), Some("6"));

    let bookings = rows(&client, "SELECT * FROM bookings WHERE date = '2031-03-03'").await;
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].get("grower_name"), Some("Hill Farm"));
    assert_eq!(bookings[0].get("cultivar_name"), Some("Packham"));
    assert_eq!(bookings[0].get("status"), Some("confirmed"));
}

#[tokio::test]
async fn overbooking_is_rejected() {
    let addr = start_test_server().await;
    let client = admin(addr).await;
    let (grower_id, _, slot_id) = seed(&client, 5).await;

    let err = client
        .batch_execute(&format!(
            "INSERT INTO bookings (slot_id, grower_id, quantity) VALUES ('{slot_id}', '{grower_id}', 6)"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "23514");

    let usage = rows(&client, &format!("SELECT * FROM slot_usage WHERE slot_id = '{slot_id}'")).await;
    assert_eq!(usage[0].get("booked"), Some("0"));
}

#[tokio::test]
async fn cancelling_frees_capacity() {
    let addr = start_test_server().await;
    let client = admin(addr).await;
    let (grower_id, _, slot_id) = seed(&client, 5).await;
    let booking_id = Ulid::new();

    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, slot_id, grower_id, quantity) \
             VALUES ('{booking_id}', '{slot_id}', '{grower_id}', 5)"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{booking_id}'"))
        .await
        .unwrap();

    let booking = rows(&client, &format!("SELECT * FROM bookings WHERE id = '{booking_id}'")).await;
    assert_eq!(booking[0].get("status"), Some("cancelled"));
    let usage = rows(&client, &format!("SELECT * FROM slot_usage WHERE slot_id = '{slot_id}'")).await;
    assert_eq!(usage[0].get("remaining"), Some("5"));
}

#[tokio::test]
async fn grower_books_for_self_only() {
    let addr = start_test_server().await;
    let admin_client = admin(addr).await;
    let (grower_id, _, slot_id) = seed(&admin_client, 10).await;
    let other = Ulid::new();
    admin_client
        .batch_execute(&format!("INSERT INTO growers (id, name) VALUES ('{other}', 'River Orchards')"))
        .await
        .unwrap();

    let client = grower(addr, grower_id).await;
    // grower_id defaults to the caller
    client
        .batch_execute(&format!("INSERT INTO bookings (slot_id, quantity) VALUES ('{slot_id}', 3)"))
        .await
        .unwrap();

    let err = client
        .batch_execute(&format!(
            "INSERT INTO bookings (slot_id, grower_id, quantity) VALUES ('{slot_id}', '{other}', 1)"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");

    let mine = rows(&client, "SELECT * FROM bookings").await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].get("grower_id"), Some(grower_id.to_string().as_str()));
}

#[tokio::test]
async fn grower_cannot_run_admin_statements() {
    let addr = start_test_server().await;
    let admin_client = admin(addr).await;
    let (grower_id, _, _) = seed(&admin_client, 10).await;

    let client = grower(addr, grower_id).await;
    let err = client
        .batch_execute(
            "INSERT INTO slots (date, start_time, end_time, capacity) \
             VALUES ('2031-03-04', '08:00', '09:00', 5)",
        )
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");

    let err = client
        .simple_query("SELECT * FROM bookings_export WHERE start_date = '2031-03-01' AND end_date = '2031-03-31'")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");

    // Reads open to growers still work.
    assert_eq!(rows(&client, "SELECT * FROM slots").await.len(), 1);
}

#[tokio::test]
async fn blackout_blocks_new_bookings() {
    let addr = start_test_server().await;
    let client = admin(addr).await;
    let (grower_id, _, slot_id) = seed(&client, 10).await;

    let summary = rows(
        &client,
        &format!("INSERT INTO blackouts (slot_id, note) VALUES ('{slot_id}', 'cold room repairs')"),
    )
    .await;
    assert_eq!(summary[0].get("affected_slots"), Some("1"));
    assert_eq!(summary[0].get("scope"), Some("slot"));

    let err = client
        .batch_execute(&format!(
            "INSERT INTO bookings (slot_id, grower_id, quantity) VALUES ('{slot_id}', '{grower_id}', 1)"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");
}

#[tokio::test]
async fn next_available_skips_full_slots() {
    let addr = start_test_server().await;
    let client = admin(addr).await;
    let (grower_id, _, full_slot) = seed(&client, 2).await;
    let open_slot = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO slots (id, date, start_time, end_time, capacity) \
             VALUES ('{open_slot}', '2031-03-03', '10:00', '11:00', 8);
             INSERT INTO bookings (slot_id, grower_id, quantity) VALUES ('{full_slot}', '{grower_id}', 2)"
        ))
        .await
        .unwrap();

    let available = rows(
        &client,
        "SELECT * FROM next_available WHERE from_datetime = '2031-03-03 00:00' AND max_results = 5",
    )
    .await;
    assert_eq!(available.len(), 1);
    assert_eq!(available[0].get("slot_id"), Some(open_slot.to_string().as_str()));
    assert_eq!(available[0].get("remaining"), Some("8"));
}

#[tokio::test]
async fn slot_series_and_csv_export() {
    let addr = start_test_server().await;
    let client = admin(addr).await;
    let grower_id = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO growers (id, name) VALUES ('{grower_id}', 'Smith, Sons')"))
        .await
        .unwrap();

    // 2031-03-03 is a Monday; two hour-long slots per weekday.
    let created = rows(
        &client,
        "INSERT INTO slot_series (start_date, end_date, weekdays, slot_length_min, capacity, day_start, day_end) \
         VALUES ('2031-03-03', '2031-03-09', '1,2,3,4,5', 60, 10, '08:00', '10:00')",
    )
    .await;
    assert_eq!(created[0].get("count"), Some("10"));

    let monday = rows(&client, "SELECT * FROM slots WHERE date = '2031-03-03'").await;
    assert_eq!(monday.len(), 2);
    let slot_id = monday[0].get("id").unwrap().to_string();
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (slot_id, grower_id, quantity, notes) \
             VALUES ('{slot_id}', '{grower_id}', 7, 'north gate')"
        ))
        .await
        .unwrap();

    let csv = rows(
        &client,
        "SELECT * FROM bookings_csv WHERE start_date = '2031-03-01' AND end_date = '2031-03-31'",
    )
    .await;
    assert_eq!(csv[0].get("filename"), Some("bookings_2031-03-01_2031-03-31.csv"));
    let content = csv[0].get("content").unwrap();
    let mut lines = content.lines();
    assert!(lines.next().unwrap().starts_with("booking_id,slot_date"));
    let line = lines.next().unwrap();
    assert!(line.contains(",2031-03-03,08:00,09:00,\"Smith, Sons\",,7,confirmed,north gate"));
    assert!(lines.next().is_none());
}

#[tokio::test]
async fn tenants_are_isolated_by_database() {
    let addr = start_test_server().await;
    let client = admin(addr).await;
    seed(&client, 10).await;

    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("other_packhouse")
        .user("admin")
        .password(ADMIN_PASSWORD);
    let (other, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });

    assert!(rows(&other, "SELECT * FROM slots").await.is_empty());
    assert!(rows(&other, "SELECT * FROM growers").await.is_empty());
    assert_eq!(rows(&client, "SELECT * FROM slots").await.len(), 1);
}

#[tokio::test]
async fn parameters_bind_as_text() {
    let addr = start_test_server().await;
    let client = admin(addr).await;
    let id = Ulid::new().to_string();

    let inserted = client
        .execute("INSERT INTO growers (id, name) VALUES ($1, $2)", &[&id, &"O'Neil Farms"])
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let growers = rows(&client, "SELECT * FROM growers").await;
    assert_eq!(growers[0].get("id"), Some(id.as_str()));
    assert_eq!(growers[0].get("name"), Some("O'Neil Farms"));
}

#[tokio::test]
async fn unknown_table_and_column_errors() {
    let addr = start_test_server().await;
    let client = admin(addr).await;

    let err = client.simple_query("SELECT * FROM harvests").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42P01");

    let err = client
        .simple_query("INSERT INTO growers (id, name, colour) VALUES ('x', 'y', 'z')")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42703");
}

#[tokio::test]
async fn domain_events_record_bookings() {
    let addr = start_test_server().await;
    let client = admin(addr).await;
    let (grower_id, _, slot_id) = seed(&client, 10).await;
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (slot_id, grower_id, quantity) VALUES ('{slot_id}', '{grower_id}', 2)"
        ))
        .await
        .unwrap();

    let events = rows(&client, "SELECT * FROM domain_events WHERE after_seq = 0").await;
    assert!(events.iter().any(|e| e.get("kind") == Some("BOOKING_CREATED")));
}
