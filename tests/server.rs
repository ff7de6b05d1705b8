//! Transient audio server behavior over real sockets

mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use echocast::server::AudioServer;

use common::temp_audio;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[tokio::test]
async fn serves_the_file_behind_its_token() {
    let dir = tempfile::tempdir().unwrap();
    let audio = temp_audio(dir.path());
    let expected = std::fs::read(&audio).unwrap();

    let server = AudioServer::start(audio, Duration::from_secs(120))
        .await
        .unwrap();

    let response = reqwest::get(server.url_for(LOCALHOST)).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("audio/mpeg")
    );
    assert_eq!(response.bytes().await.unwrap().as_ref(), expected);

    server.shutdown().await;
}

#[tokio::test]
async fn wrong_token_and_unknown_paths_get_404() {
    let dir = tempfile::tempdir().unwrap();
    let server = AudioServer::start(temp_audio(dir.path()), Duration::from_secs(120))
        .await
        .unwrap();
    let port = server.port();

    let bad_token = reqwest::get(format!("http://127.0.0.1:{port}/audio/not-the-token"))
        .await
        .unwrap();
    assert_eq!(bad_token.status(), reqwest::StatusCode::NOT_FOUND);

    let bad_path = reqwest::get(format!("http://127.0.0.1:{port}/somewhere-else"))
        .await
        .unwrap();
    assert_eq!(bad_path.status(), reqwest::StatusCode::NOT_FOUND);

    server.shutdown().await;
}

#[tokio::test]
async fn port_is_released_after_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let server = AudioServer::start(temp_audio(dir.path()), Duration::from_secs(120))
        .await
        .unwrap();
    let port = server.port();

    server.shutdown().await;

    tokio::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
        .await
        .expect("port rebindable after shutdown");
}

#[tokio::test]
async fn idle_server_shuts_itself_down() {
    let dir = tempfile::tempdir().unwrap();
    let server = AudioServer::start(temp_audio(dir.path()), Duration::from_secs(1))
        .await
        .unwrap();
    let url = server.url_for(LOCALHOST);

    // The watchdog checks every 2s, so give it two ticks.
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(
        reqwest::get(url).await.is_err(),
        "server should refuse connections once idle"
    );
    server.shutdown().await;
}
