//! Alert delivery against local mock servers

use chrono::{TimeZone, Utc};
use mirrorgate::config::{TelegramConfig, WebhookConfig};
use mirrorgate::notifications::{
    compute_hmac_signature, AdminAlert, FailoverAction, Notifier, NotifierHub, SyncOutcome,
    TelegramNotifier, WebhookNotifier,
};
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

#[derive(Debug)]
struct CapturedRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: String,
}

async fn read_request(stream: &mut TcpStream) -> Option<CapturedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.lines();
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();

    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    while buf.len() < header_end + length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    Some(CapturedRequest {
        method,
        path,
        headers,
        body: String::from_utf8_lossy(&buf[header_end..]).into_owned(),
    })
}

/// Mock server answering every request with `status_line`, forwarding what it saw
async fn start_capture_server(
    status_line: &'static str,
) -> (String, mpsc::UnboundedReceiver<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Some(request) = read_request(&mut stream).await {
                    let _ = tx.send(request);
                }
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
                    status_line
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (format!("http://{}", addr), rx)
}

fn alert() -> AdminAlert {
    AdminAlert {
        host: "a.example.com".to_string(),
        reason: "fail:none:connect_timeout".to_string(),
        action: FailoverAction::Replaced {
            replacement: "b.example.com".to_string(),
            sync: SyncOutcome::Applied {
                summary: "generated: 2 files, domains_map: 2".to_string(),
            },
        },
        at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
    }
}

#[tokio::test]
async fn test_webhook_is_signed() {
    let (base, mut rx) = start_capture_server("200 OK").await;
    let notifier = WebhookNotifier::new(
        reqwest::Client::new(),
        WebhookConfig {
            url: format!("{}/hooks/mirrors", base),
            secret: Some("s3cret".to_string()),
        },
    );

    notifier.notify(&alert()).await.unwrap();

    let request = rx.recv().await.unwrap();
    assert_eq!(request.method, "POST");
    assert_eq!(request.path, "/hooks/mirrors");
    assert_eq!(
        request.headers.get("x-signature-256").unwrap(),
        &format!("sha256={}", compute_hmac_signature("s3cret", &request.body))
    );

    let body: serde_json::Value = serde_json::from_str(&request.body).unwrap();
    assert_eq!(body["event"], "domain_blocked");
    assert_eq!(body["alert"]["host"], "a.example.com");
    assert_eq!(body["alert"]["action"]["kind"], "replaced");
    assert_eq!(body["alert"]["action"]["replacement"], "b.example.com");
}

#[tokio::test]
async fn test_webhook_without_secret_is_unsigned() {
    let (base, mut rx) = start_capture_server("200 OK").await;
    let notifier = WebhookNotifier::new(
        reqwest::Client::new(),
        WebhookConfig {
            url: base,
            secret: None,
        },
    );

    notifier.notify(&alert()).await.unwrap();

    let request = rx.recv().await.unwrap();
    assert!(!request.headers.contains_key("x-signature-256"));
}

#[tokio::test]
async fn test_webhook_error_status_is_reported() {
    let (base, _rx) = start_capture_server("500 Internal Server Error").await;
    let notifier = WebhookNotifier::new(
        reqwest::Client::new(),
        WebhookConfig {
            url: base,
            secret: None,
        },
    );

    let err = notifier.notify(&alert()).await.unwrap_err();
    assert!(err.to_string().contains("500"));
}

#[tokio::test]
async fn test_telegram_reaches_every_chat() {
    let (base, mut rx) = start_capture_server("200 OK").await;
    let notifier = TelegramNotifier::new(
        reqwest::Client::new(),
        TelegramConfig {
            bot_token: "123:abc".to_string(),
            chat_ids: vec![111, -222],
            api_base: base,
        },
    );

    notifier.notify(&alert()).await.unwrap();

    let mut chats = Vec::new();
    for _ in 0..2 {
        let request = rx.recv().await.unwrap();
        assert_eq!(request.path, "/bot123:abc/sendMessage");
        let body: serde_json::Value = serde_json::from_str(&request.body).unwrap();
        assert!(body["text"].as_str().unwrap().contains("Mirror blocked: a.example.com"));
        chats.push(body["chat_id"].as_i64().unwrap());
    }
    assert_eq!(chats, vec![111, -222]);
}

#[tokio::test]
async fn test_hub_isolates_failing_channel() {
    let (broken, _broken_rx) = start_capture_server("502 Bad Gateway").await;
    let (working, mut working_rx) = start_capture_server("200 OK").await;
    let client = reqwest::Client::new();

    let hub = NotifierHub::new(vec![
        Box::new(TelegramNotifier::new(
            client.clone(),
            TelegramConfig {
                bot_token: "t".to_string(),
                chat_ids: vec![1],
                api_base: broken,
            },
        )),
        Box::new(WebhookNotifier::new(
            client,
            WebhookConfig {
                url: working,
                secret: None,
            },
        )),
    ]);

    hub.notify(&alert()).await.unwrap();
    assert!(working_rx.recv().await.is_some());
}
