//! Session state behaviour: cookie jar maintenance across responses and
//! redirects, and persistence round-trips.

use raider::{AuthGraph, Flow, Operation, Plugin, Raider, Request};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn jar_keeps_cookies_until_the_server_clears_them() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "sid=abc; Path=/")
                .append_header("set-cookie", "theme=dark; Path=/"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b"))
        .respond_with(
            ResponseTemplate::new(200).insert_header("set-cookie", "theme=gone; Max-Age=0"),
        )
        .mount(&server)
        .await;

    let graph = AuthGraph::builder()
        .base_url(server.uri())
        .flow(Flow::new("first", Request::get_path("/a")))
        .flow(Flow::new("second", Request::get_path("/b")))
        .build()
        .unwrap();

    let mut raider = Raider::new(graph).unwrap();
    let outcome = raider.authenticate().await;

    assert!(outcome.is_ok(), "unexpected outcome: {outcome:?}");
    let jar = raider.session().cookies();
    assert_eq!(jar.value("sid"), Some("abc".to_string()));
    assert_eq!(jar.value("theme"), None);
}

#[tokio::test]
async fn redirect_hop_cookies_land_in_the_jar() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/start"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("set-cookie", "hop=1; Path=/")
                .insert_header("location", format!("{}/landed", server.uri())),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/landed"))
        .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "final=2; Path=/"))
        .mount(&server)
        .await;

    let graph = AuthGraph::builder()
        .base_url(server.uri())
        .flow(Flow::new("start", Request::get_path("/start")))
        .build()
        .unwrap();

    let mut raider = Raider::new(graph).unwrap();
    let outcome = raider.authenticate().await;

    assert!(outcome.is_ok(), "unexpected outcome: {outcome:?}");
    let jar = raider.session().cookies();
    assert_eq!(jar.value("hop"), Some("1".to_string()));
    assert_eq!(jar.value("final"), Some("2".to_string()));
}

#[tokio::test]
async fn stored_cookies_are_sent_on_later_requests() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "sid=abc; Path=/"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b"))
        .and(header("cookie", "sid=abc"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let graph = AuthGraph::builder()
        .base_url(server.uri())
        .flow(Flow::new("first", Request::get_path("/a")))
        .flow(Flow::new("second", Request::get_path("/b")))
        .build()
        .unwrap();

    let mut raider = Raider::new(graph).unwrap();
    assert!(raider.authenticate().await.is_ok());
}

#[tokio::test]
async fn dumped_session_reloads_into_a_fresh_instance() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "sid=abc; Path=/")
                .set_body_string("\"accessToken\":\"TOK\""),
        )
        .mount(&server)
        .await;

    let graph = || {
        AuthGraph::builder()
            .base_url(server.uri())
            .flow(
                Flow::new("init", Request::get_path("/login"))
                    .output(Plugin::cookie("sid"))
                    .output(
                        Plugin::regex("access_token", "\"accessToken\":\"([^\"]+)\"").unwrap(),
                    )
                    .operation(Operation::stop()),
            )
            .build()
            .unwrap()
    };

    let dir = tempfile::tempdir().unwrap();
    let slot = dir.path().join("target-app");

    let mut first = Raider::new(graph()).unwrap();
    assert!(first.authenticate().await.is_ok());
    first.dump_session(&slot).unwrap();

    let mut second = Raider::new(graph()).unwrap();
    second.load_session(&slot).unwrap();
    assert_eq!(second.session().store().get("sid"), Some("abc"));
    assert_eq!(second.session().store().get("access_token"), Some("TOK"));
    assert_eq!(
        second.session().cookies().value("sid"),
        Some("abc".to_string())
    );

    let other_slot = dir.path().join("second-dump");
    second.dump_session(&other_slot).unwrap();
    for file in ["cookies.json", "values.json"] {
        assert_eq!(
            std::fs::read(slot.join(file)).unwrap(),
            std::fs::read(other_slot.join(file)).unwrap(),
            "{file} must round-trip byte-equal"
        );
    }
}
