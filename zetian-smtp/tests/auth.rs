//! AUTH engine tests: gating, PLAIN, LOGIN, cancellation, monotonicity.

mod support;

use base64::{Engine, engine::general_purpose::STANDARD};
use support::{Client, config, start};

fn plain_initial(authzid: &str, authcid: &str, password: &str) -> String {
    STANDARD.encode(format!("{authzid}\0{authcid}\0{password}"))
}

#[tokio::test]
async fn plaintext_auth_is_refused_by_default() {
    let server = start(config()).await;
    let mut client = Client::connect_and_greet(server.addr).await;

    let ehlo = client.ehlo("client.test").await;
    assert!(
        ehlo.iter().all(|line| !line.starts_with("AUTH")),
        "AUTH must not be advertised in the clear: {ehlo:?}"
    );

    let reply = client
        .cmd(&format!("AUTH PLAIN {}", plain_initial("", "alice", "secret")))
        .await;
    assert!(reply.starts_with("538 "), "got {reply:?}");
}

#[tokio::test]
async fn auth_plain_with_initial_response() {
    let mut config = config();
    config.allow_plaintext_authentication = true;
    let server = start(config).await;

    let mut client = Client::connect_and_greet(server.addr).await;
    let ehlo = client.ehlo("client.test").await;
    assert!(
        ehlo.iter().any(|line| line == "AUTH PLAIN LOGIN"),
        "AUTH should be advertised: {ehlo:?}"
    );

    let reply = client
        .cmd(&format!("AUTH PLAIN {}", plain_initial("", "alice", "secret")))
        .await;
    assert!(reply.starts_with("235 "), "got {reply:?}");

    // IsAuthenticated is monotonic: a second attempt is out of sequence
    let reply = client
        .cmd(&format!("AUTH PLAIN {}", plain_initial("", "alice", "secret")))
        .await;
    assert!(reply.starts_with("503 "), "got {reply:?}");

    // And AUTH disappears from the next EHLO
    let ehlo = client.ehlo("client.test").await;
    assert!(ehlo.iter().all(|line| !line.starts_with("AUTH")));
}

#[tokio::test]
async fn auth_plain_prompted() {
    let mut config = config();
    config.allow_plaintext_authentication = true;
    let server = start(config).await;

    let mut client = Client::connect_and_greet(server.addr).await;
    client.ehlo("client.test").await;

    // Without an initial response the server prompts with an empty 334
    let prompt = client.cmd("AUTH PLAIN").await;
    assert_eq!(prompt, "334 ");

    let reply = client.cmd(&plain_initial("", "alice", "secret")).await;
    assert!(reply.starts_with("235 "), "got {reply:?}");
}

#[tokio::test]
async fn auth_login_two_steps() {
    let mut config = config();
    config.allow_plaintext_authentication = true;
    let server = start(config).await;

    let mut client = Client::connect_and_greet(server.addr).await;
    client.ehlo("client.test").await;

    assert_eq!(client.cmd("AUTH LOGIN").await, "334 VXNlcm5hbWU6");
    assert_eq!(
        client.cmd(&STANDARD.encode("alice")).await,
        "334 UGFzc3dvcmQ6"
    );
    let reply = client.cmd(&STANDARD.encode("secret")).await;
    assert!(reply.starts_with("235 "), "got {reply:?}");
}

#[tokio::test]
async fn bad_credentials_get_535() {
    let mut config = config();
    config.allow_plaintext_authentication = true;
    let server = start(config).await;

    let mut client = Client::connect_and_greet(server.addr).await;
    client.ehlo("client.test").await;

    let reply = client
        .cmd(&format!("AUTH PLAIN {}", plain_initial("", "alice", "wrong")))
        .await;
    assert!(reply.starts_with("535 "), "got {reply:?}");

    // Failure is not sticky; the right password still works
    let reply = client
        .cmd(&format!("AUTH PLAIN {}", plain_initial("", "alice", "secret")))
        .await;
    assert!(reply.starts_with("235 "), "got {reply:?}");
}

#[tokio::test]
async fn auth_can_be_cancelled_with_a_star() {
    let mut config = config();
    config.allow_plaintext_authentication = true;
    let server = start(config).await;

    let mut client = Client::connect_and_greet(server.addr).await;
    client.ehlo("client.test").await;

    assert_eq!(client.cmd("AUTH LOGIN").await, "334 VXNlcm5hbWU6");
    let reply = client.cmd("*").await;
    assert!(reply.starts_with("501 "), "got {reply:?}");

    // The session continues unauthenticated
    client.expect("MAIL FROM:<a@x.com>", "250 ").await;
}

#[tokio::test]
async fn bad_base64_gets_501() {
    let mut config = config();
    config.allow_plaintext_authentication = true;
    let server = start(config).await;

    let mut client = Client::connect_and_greet(server.addr).await;
    client.ehlo("client.test").await;

    let reply = client.cmd("AUTH PLAIN !!!not-base64!!!").await;
    assert!(reply.starts_with("501 "), "got {reply:?}");
}

#[tokio::test]
async fn unknown_mechanism_gets_504() {
    let mut config = config();
    config.allow_plaintext_authentication = true;
    let server = start(config).await;

    let mut client = Client::connect_and_greet(server.addr).await;
    client.ehlo("client.test").await;

    let reply = client.cmd("AUTH CRAM-MD5").await;
    assert!(reply.starts_with("504 "), "got {reply:?}");
}

#[tokio::test]
async fn unconfigured_mechanism_is_refused_even_if_registered() {
    let mut config = config();
    config.allow_plaintext_authentication = true;
    config.mechanisms = vec!["PLAIN".to_string()];
    let server = start(config).await;

    let mut client = Client::connect_and_greet(server.addr).await;
    let ehlo = client.ehlo("client.test").await;
    assert!(ehlo.iter().any(|line| line == "AUTH PLAIN"));

    // LOGIN is registered by default but not configured
    let reply = client.cmd("AUTH LOGIN").await;
    assert!(reply.starts_with("504 "), "got {reply:?}");
}

#[tokio::test]
async fn require_authentication_gates_mail() {
    let mut config = config();
    config.allow_plaintext_authentication = true;
    config.require_authentication = true;
    let server = start(config).await;

    let mut client = Client::connect_and_greet(server.addr).await;
    client.ehlo("client.test").await;

    client.expect("MAIL FROM:<a@x.com>", "530 ").await;

    let reply = client
        .cmd(&format!("AUTH PLAIN {}", plain_initial("", "alice", "secret")))
        .await;
    assert!(reply.starts_with("235 "));

    client.expect("MAIL FROM:<a@x.com>", "250 ").await;
}

#[tokio::test]
async fn auth_is_rejected_mid_transaction() {
    let mut config = config();
    config.allow_plaintext_authentication = true;
    let server = start(config).await;

    let mut client = Client::connect_and_greet(server.addr).await;
    client.ehlo("client.test").await;
    client.expect("MAIL FROM:<a@x.com>", "250 ").await;

    let reply = client
        .cmd(&format!("AUTH PLAIN {}", plain_initial("", "alice", "secret")))
        .await;
    assert!(reply.starts_with("503 "), "got {reply:?}");
}
