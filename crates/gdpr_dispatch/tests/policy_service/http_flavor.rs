#![forbid(unsafe_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use gdpr_contracts::{
    DeviceId, FieldMap, PolicySelector, Record, RecordKey, Status, UnixSeconds, UnixTimeMs,
};
use gdpr_dispatch::{
    AuditEntry, AuditHttpConfig, AuditSink, AuditSinkRuntime, DefaultConnector, DispatchConfig,
    HttpLiveCountOracle, OperationDispatcher, PolicyDefaults,
};
use gdpr_storage::ServiceCredentials;
use parking_lot::Mutex;
use serde_json::{json, Value};

type Seen = Arc<Mutex<Vec<(String, Value, Option<String>)>>>;

/// Single-threaded HTTP/1.1 responder on an ephemeral loopback port.
struct LoopbackService {
    base_url: String,
    seen: Seen,
}

impl LoopbackService {
    fn start<F>(respond: F) -> Self
    where
        F: Fn(&str, &Value) -> (u16, String) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                serve_one(stream, &respond, &log);
            }
        });
        Self { base_url, seen }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn paths(&self) -> Vec<String> {
        self.seen.lock().iter().map(|(p, _, _)| p.clone()).collect()
    }

    fn bodies(&self, path: &str) -> Vec<Value> {
        self.seen
            .lock()
            .iter()
            .filter(|(p, _, _)| p == path)
            .map(|(_, b, _)| b.clone())
            .collect()
    }

    fn authorizations(&self) -> Vec<Option<String>> {
        self.seen.lock().iter().map(|(_, _, a)| a.clone()).collect()
    }
}

fn serve_one<F>(mut stream: TcpStream, respond: &F, log: &Seen)
where
    F: Fn(&str, &Value) -> (u16, String),
{
    let Ok(read_half) = stream.try_clone() else {
        return;
    };
    let mut reader = BufReader::new(read_half);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
        return;
    }
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();
    let mut content_length = 0usize;
    let mut authorization = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            } else if name.trim().eq_ignore_ascii_case("authorization") {
                authorization = Some(value.trim().to_string());
            }
        }
    }
    let mut body = vec![0u8; content_length];
    if reader.read_exact(&mut body).is_err() {
        return;
    }
    let json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let (status, reply) = respond(&path, &json);
    log.lock().push((path, json, authorization));
    let reason = match status {
        200 => "OK",
        201 => "Created",
        404 => "Not Found",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{reply}",
        reply.len()
    );
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.flush();
}

fn fields(pairs: &[(&str, &str)]) -> FieldMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn service_client(service: &LoopbackService, tweak: impl FnOnce(&mut DispatchConfig)) -> OperationDispatcher {
    let mut config = DispatchConfig::for_endpoints([service.base_url.clone()]).unwrap();
    tweak(&mut config);
    OperationDispatcher::init_with(
        config,
        &DefaultConnector::new(),
        AuditSink::new(AuditSinkRuntime::Recording),
    )
    .unwrap()
}

fn stored_record() -> String {
    let record = Record::new(
        RecordKey::new("o1").unwrap(),
        fields(&[("shop_name", "store 7"), ("device_id", "42")]),
    )
    .unwrap();
    json!({ "records": [record] }).to_string()
}

#[test]
fn at_policy_service_db_01_insert_posts_fields_and_expects_created() {
    let service = LoopbackService::start(|path, body| match path {
        "/add_obj/" if body["id"] == json!("o1") => (201, "{}".to_string()),
        "/add_obj/" => (200, "{}".to_string()),
        _ => (404, String::new()),
    });
    let c = service_client(&service, |_| {});
    let f = fields(&[("shop_name", "store 7"), ("device_id", "42")]);
    assert_eq!(c.insert("usertable", "o1", &f), Status::Ok);
    // 200 where 201 is expected is a failure.
    assert_eq!(c.insert("usertable", "o2", &f), Status::Error);

    let posted = service.bodies("/add_obj/");
    assert_eq!(posted.len(), 2);
    assert_eq!(posted[0]["table"], json!("usertable"));
    assert_eq!(posted[0]["fields"]["shop_name"], json!("store 7"));
    assert_eq!(posted[0]["fields"]["device_id"], json!("42"));
    assert!(!posted[0]["query"].as_str().unwrap().contains("store 7"));
}

#[test]
fn at_policy_service_db_02_read_maps_not_found_and_noise() {
    let service = LoopbackService::start(|path, body| match (path, body["id"].as_str()) {
        ("/get_obj/", Some("o1")) => (200, stored_record()),
        ("/get_obj/", Some("broken")) => (500, String::new()),
        ("/delete_obj/", Some("broken")) => (500, String::new()),
        ("/delete_obj/", Some("o1")) => (200, json!({ "affected": 1 }).to_string()),
        _ => (404, String::new()),
    });
    let c = service_client(&service, |_| {});
    let found = c.read("usertable", "o1");
    assert_eq!(found.status, Status::Ok);
    let record = found.value.unwrap();
    assert_eq!(record.device_id, DeviceId(42));
    assert_eq!(record.fields["shop_name"], "store 7");

    assert_eq!(c.read("usertable", "missing").status, Status::NotFound);
    assert_eq!(c.read("usertable", "broken").status, Status::Ok);
    assert_eq!(c.delete("usertable", "broken"), Status::Error);
    assert_eq!(c.delete("usertable", "o1"), Status::Ok);
    assert_eq!(c.delete("usertable", "gone"), Status::NotFound);
}

#[test]
fn at_policy_service_db_03_policy_track_round_trip() {
    let ttl = UnixSeconds::now().saturating_add_secs(3_600);
    let policy_row = PolicyDefaults::default()
        .draft(ttl)
        .into_metadata(RecordKey::new("o3000000").unwrap(), DeviceId(42), UnixTimeMs::now())
        .unwrap();
    let reply = json!({ "policies": [policy_row] }).to_string();
    let service = LoopbackService::start(move |path, _| match path {
        "/add_obj/" | "/madd_obj/" => (201, "{}".to_string()),
        "/mget_obj/" => (200, reply.clone()),
        "/mdelete_obj/" => (200, json!({ "affected": 1 }).to_string()),
        _ => (404, String::new()),
    });
    let c = service_client(&service, |_| {});
    let out = c.insert_with_expiry(
        "usertable",
        "o3000000",
        &fields(&[("shop_name", "store 7"), ("device_id", "42")]),
        ttl,
    );
    assert_eq!((out.data, out.policy), (Status::Ok, Status::Ok));

    let madd = service.bodies("/madd_obj/");
    assert_eq!(madd.len(), 1);
    assert_eq!(madd[0]["fields"]["id"], json!("o3000000"));
    assert_eq!(madd[0]["fields"]["device_id"], json!(42));
    assert_eq!(madd[0]["fields"]["ttl"], json!(ttl.0));
    assert_eq!(madd[0]["fields"]["enforcement_action"], json!("allow"));
    assert_eq!(madd[0]["table"], json!("user_policy"));

    let selector = PolicySelector::Device {
        id: RecordKey::new("o3000000").unwrap(),
        device_id: DeviceId(42),
    };
    let read = c.read_policy(&selector);
    assert_eq!(read.status, Status::Ok);
    let rows = read.value.unwrap();
    assert!(rows[0].is_allow());
    assert_eq!(rows[0].ttl, ttl);
    let mget = service.bodies("/mget_obj/");
    assert_eq!(mget[0]["selector"]["device"]["device_id"], json!(42));

    assert_eq!(c.delete_policy(&selector), Status::Ok);
    assert_eq!(
        service.paths(),
        vec!["/add_obj/", "/madd_obj/", "/mget_obj/", "/mdelete_obj/"]
    );
}

#[test]
fn at_policy_service_db_04_batch_rows_post_one_by_one_on_flush() {
    let service = LoopbackService::start(|path, _| match path {
        "/add_obj/" => (201, "{}".to_string()),
        _ => (404, String::new()),
    });
    let c = service_client(&service, |cfg| {
        cfg.batch_size = 3;
        cfg.batch_update_api = true;
    });
    let f = fields(&[("device_id", "1")]);
    assert_eq!(c.insert("usertable", "o1", &f), Status::BatchedOk);
    assert_eq!(c.insert("usertable", "o2", &f), Status::BatchedOk);
    assert!(service.paths().is_empty());
    assert_eq!(c.insert("usertable", "o3", &f), Status::Ok);
    let ids: Vec<_> = service
        .bodies("/add_obj/")
        .iter()
        .map(|b| b["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["o1", "o2", "o3"]);
}

#[test]
fn at_policy_service_db_05_audit_accepts_only_created() {
    let service = LoopbackService::start(|path, body| match (path, body["result"].as_str()) {
        ("/add_log/", Some("OK")) => (201, String::new()),
        ("/add_log/", Some("NOT_FOUND")) => (200, String::new()),
        _ => (500, String::new()),
    });
    let sink = AuditSink::new(AuditSinkRuntime::Http(AuditHttpConfig::new(
        service.url("/add_log/"),
    )));
    sink.record(AuditEntry::new("42", "SELECT * FROM usertable WHERE key = $1", "OK"));
    sink.record(AuditEntry::new("42", "SELECT * FROM usertable WHERE key = $1", "NOT_FOUND"));
    sink.record(AuditEntry::new("42", "DELETE", "ERROR"));
    assert_eq!(sink.delivered_count(), 1);
    assert_eq!(sink.failed_count(), 2);

    let posted = service.bodies("/add_log/");
    assert_eq!(posted.len(), 3);
    assert_eq!(posted[0]["querier"], json!("42"));
    assert_eq!(posted[0]["query"], json!("SELECT * FROM usertable WHERE key = $1"));
}

#[test]
fn at_policy_service_db_06_http_live_count_drives_verify_ttl() {
    let script = Arc::new(Mutex::new(vec![0u64, 2, 3]));
    let service = LoopbackService::start(move |path, _| match path {
        "/live_count/" => {
            let next = script.lock().pop().unwrap_or(0);
            (200, json!({ "count": next }).to_string())
        }
        _ => (404, String::new()),
    });
    let oracle = HttpLiveCountOracle::new(service.url("/live_count/"), Duration::from_secs(2));
    let c = service_client(&service, |cfg| cfg.ttl.poll_interval = Duration::from_millis(5))
        .with_live_count_oracle(Box::new(oracle));
    let out = c.verify_ttl(0);
    assert_eq!(out.status, Status::Ok);
    assert_eq!(out.value.unwrap().polls(), 3);
}

#[test]
fn at_policy_service_db_07_login_travels_as_basic_auth() {
    let service = LoopbackService::start(|path, _| match path {
        "/add_obj/" => (201, "{}".to_string()),
        _ => (404, String::new()),
    });
    let c = service_client(&service, |cfg| {
        cfg.credentials = ServiceCredentials::from_parts(Some("alice".into()), Some("s3cret".into()));
    });
    assert_eq!(c.insert("usertable", "o1", &fields(&[("device_id", "1")])), Status::Ok);
    assert_eq!(c.read("usertable", "o1").status, Status::NotFound);
    assert_eq!(
        service.authorizations(),
        vec![Some("Basic YWxpY2U6czNjcmV0".to_string()); 2]
    );

    let anonymous = service_client(&service, |_| {});
    assert_eq!(anonymous.read("usertable", "o1").status, Status::NotFound);
    assert_eq!(service.authorizations()[2], None);
}
