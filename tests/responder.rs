use std::{
    net::{SocketAddr, TcpListener},
    sync::Arc,
    time::Duration,
};

use cerberus::{
    account::Account,
    challenge::{ChallengeNotifier, PendingChallenge},
    error::ResponderError,
    keys::{AccountKey, ServerKey},
    order::OrderOrchestrator,
    responder::ChallengeResponder,
    Settings,
};

fn free_addr() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap()
}

#[tokio::test]
async fn serves_published_challenges() {
    let mailbox = Arc::new(ChallengeNotifier::new());
    let responder = ChallengeResponder::start(
        ([127, 0, 0, 1], 0).into(),
        Arc::clone(&mailbox),
        Duration::from_millis(200),
    )
    .unwrap();
    let base = format!("http://{}", responder.local_addr());

    mailbox.publish(PendingChallenge::new("tok3n", "tok3n.thumb", "example.com"));

    let res = reqwest::get(format!("{base}/.well-known/acme-challenge/tok3n"))
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "tok3n.thumb");

    let res = reqwest::get(format!("{base}/.well-known/acme-challenge/unknown"))
        .await
        .unwrap();
    assert_eq!(res.status(), 404);
    assert!(res.text().await.unwrap().is_empty());

    let res = reqwest::get(format!("{base}/index.html")).await.unwrap();
    assert_eq!(res.status(), 404);

    responder.stop().await.unwrap();
}

#[tokio::test]
async fn late_challenge_is_still_served() {
    let mailbox = Arc::new(ChallengeNotifier::new());
    let responder = ChallengeResponder::start(
        ([127, 0, 0, 1], 0).into(),
        Arc::clone(&mailbox),
        Duration::from_secs(5),
    )
    .unwrap();
    let url = format!(
        "http://{}/.well-known/acme-challenge/late",
        responder.local_addr()
    );

    let request =
        tokio::spawn(async move { reqwest::get(url).await.unwrap().text().await.unwrap() });
    tokio::time::sleep(Duration::from_millis(100)).await;
    mailbox.publish(PendingChallenge::new("late", "late.thumb", "example.com"));

    assert_eq!(request.await.unwrap(), "late.thumb");
    responder.stop().await.unwrap();
}

#[tokio::test]
async fn port_is_released_after_stop() {
    let addr = free_addr();

    let responder =
        ChallengeResponder::start(addr, Arc::new(ChallengeNotifier::new()), Duration::from_secs(1))
            .unwrap();
    assert!(matches!(
        ChallengeResponder::start(addr, Arc::new(ChallengeNotifier::new()), Duration::from_secs(1)),
        Err(ResponderError::Bind { .. })
    ));

    responder.stop().await.unwrap();
    TcpListener::bind(addr).unwrap();
}

#[tokio::test]
async fn failed_order_releases_the_port() {
    let dir = tempfile::tempdir().unwrap();
    let addr = free_addr();
    let settings = Arc::new(Settings {
        domains: vec!["example.test".to_owned()],
        full_chain_file: dir.path().join("fullchain.pem"),
        directory_url: "http://127.0.0.1:1/directory".to_owned(),
        listen: addr,
        ..Settings::default()
    });
    let account = Account::from_json(
        br#"{
            "key": { "kid": "http://127.0.0.1:1/acct/1" },
            "status": "valid",
            "createdAt": "2023-01-01T00:00:00Z"
        }"#,
    )
    .unwrap();

    let ok = OrderOrchestrator::new(settings)
        .run(
            &AccountKey::generate().unwrap(),
            &ServerKey::generate(2048).unwrap(),
            &account,
        )
        .await;

    assert!(!ok);
    assert!(!dir.path().join("fullchain.pem").exists());
    TcpListener::bind(addr).unwrap();
}
