use crate::key::ClientKeyBuilder;
use crate::middleware::builder::RejectionBody;
use crate::middleware::RequestThrottler;
use crate::policy::Quota;
use crate::registry::ThrottleRegistry;
use actix_web::http::header::HeaderName;
use actix_web::http::StatusCode;
use actix_web::test::{self, read_body, read_body_json, TestRequest};
use actix_web::{get, App, HttpResponse, Responder};
use std::net::SocketAddr;
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);

#[get("/200")]
async fn route_200() -> impl Responder {
    HttpResponse::Ok().body("Hello world!")
}

#[get("/500")]
async fn route_500() -> impl Responder {
    HttpResponse::InternalServerError().body("Internal error")
}

fn registry() -> ThrottleRegistry {
    ThrottleRegistry::builder().sweep_interval(None).build()
}

fn peer(addr: &str) -> SocketAddr {
    addr.parse().unwrap()
}

#[actix_web::test]
async fn test_admit_then_reject() {
    let quota = Quota::new(MINUTE, 2).unwrap();
    let throttler =
        RequestThrottler::builder(registry(), quota, ClientKeyBuilder::new().peer_ip().build())
            .build();
    let app = test::init_service(App::new().service(route_200).wrap(throttler)).await;

    // Both admitted requests carry the quota headers, remaining counting down.
    for expected_remaining in ["1", "0"] {
        let request = TestRequest::get()
            .uri("/200")
            .peer_addr(peer("192.0.2.7:40000"))
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "2");
        assert_eq!(
            headers.get("x-ratelimit-remaining").unwrap(),
            expected_remaining
        );
        assert!(headers
            .get("x-ratelimit-reset")
            .unwrap()
            .to_str()
            .unwrap()
            .parse::<u64>()
            .unwrap()
            > 0);
        assert!(headers.get("retry-after").is_none());
    }

    // Third request within the window is rejected.
    let request = TestRequest::get()
        .uri("/200")
        .peer_addr(peer("192.0.2.7:40001"))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let headers = response.headers();
    assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "2");
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
    assert_eq!(headers.get("retry-after").unwrap(), "60");
    let body: RejectionBody = read_body_json(response).await;
    assert!(!body.success);
    assert_eq!(body.error, "Too many requests, please try again later.");
}

#[actix_web::test]
async fn test_custom_rejection_response() {
    let quota = Quota::new(MINUTE, 1).unwrap();
    let throttler =
        RequestThrottler::builder(registry(), quota, ClientKeyBuilder::new().peer_ip().build())
            .on_reject(|_| {
                HttpResponse::build(StatusCode::IM_A_TEAPOT).body("Custom rejection response")
            })
            .build();
    let app = test::init_service(App::new().service(route_200).wrap(throttler)).await;

    let admitted = test::call_service(
        &app,
        TestRequest::get()
            .uri("/200")
            .peer_addr(peer("192.0.2.7:40000"))
            .to_request(),
    )
    .await;
    assert_eq!(admitted.status(), StatusCode::OK);

    let rejected = test::call_service(
        &app,
        TestRequest::get()
            .uri("/200")
            .peer_addr(peer("192.0.2.7:40000"))
            .to_request(),
    )
    .await;
    assert_eq!(rejected.status(), StatusCode::IM_A_TEAPOT);
    // The handler only controls status and body; the annotations still land.
    assert_eq!(rejected.headers().get("x-ratelimit-remaining").unwrap(), "0");
    assert_eq!(rejected.headers().get("retry-after").unwrap(), "60");
    let body = String::from_utf8(read_body(rejected).await.to_vec()).unwrap();
    assert_eq!(body, "Custom rejection response");
}

#[actix_web::test]
async fn test_keys_are_isolated() {
    let quota = Quota::new(MINUTE, 1).unwrap();
    let throttler =
        RequestThrottler::builder(registry(), quota, ClientKeyBuilder::new().peer_ip().build())
            .build();
    let app = test::init_service(App::new().service(route_200).wrap(throttler)).await;

    for addr in ["192.0.2.7:40000", "198.51.100.9:40000"] {
        let response = test::call_service(
            &app,
            TestRequest::get()
                .uri("/200")
                .peer_addr(peer(addr))
                .to_request(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    // One caller exhausting its quota leaves the other untouched either way.
    for (addr, expected) in [
        ("192.0.2.7:40000", StatusCode::TOO_MANY_REQUESTS),
        ("198.51.100.9:40000", StatusCode::TOO_MANY_REQUESTS),
    ] {
        let response = test::call_service(
            &app,
            TestRequest::get()
                .uri("/200")
                .peer_addr(peer(addr))
                .to_request(),
        )
        .await;
        assert_eq!(response.status(), expected);
    }
}

#[actix_web::test]
async fn test_unidentifiable_callers_share_one_quota() {
    let quota = Quota::new(MINUTE, 1).unwrap();
    let throttler =
        RequestThrottler::builder(registry(), quota, ClientKeyBuilder::new().peer_ip().build())
            .build();
    let app = test::init_service(App::new().service(route_200).wrap(throttler)).await;

    // Neither request resolves a peer address, so both draw from the shared
    // fallback key.
    let first = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert_eq!(first.status(), StatusCode::OK);
    let second = test::call_service(&app, TestRequest::get().uri("/200").to_request()).await;
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[actix_web::test]
async fn test_composite_auth_key() {
    let quota = Quota::new(MINUTE, 1).unwrap();
    let key_fn = ClientKeyBuilder::new()
        .peer_ip()
        .header(HeaderName::from_static("x-auth-user"))
        .build();
    let throttler = RequestThrottler::builder(registry(), quota, key_fn).build();
    let app = test::init_service(App::new().service(route_200).wrap(throttler)).await;

    // Same address, different credential identifiers: separate quotas.
    for user in ["alice", "bob"] {
        let response = test::call_service(
            &app,
            TestRequest::get()
                .uri("/200")
                .peer_addr(peer("192.0.2.7:40000"))
                .insert_header(("x-auth-user", user))
                .to_request(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = test::call_service(
        &app,
        TestRequest::get()
            .uri("/200")
            .peer_addr(peer("192.0.2.7:40000"))
            .insert_header(("x-auth-user", "alice"))
            .to_request(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[actix_web::test]
async fn test_rollback_server_errors() {
    let quota = Quota::new(MINUTE, 5).unwrap();
    let throttler =
        RequestThrottler::builder(registry(), quota, ClientKeyBuilder::new().peer_ip().build())
            .rollback_server_errors()
            .build();
    let app = test::init_service(
        App::new()
            .service(route_200)
            .service(route_500)
            .wrap(throttler),
    )
    .await;

    let ok = test::call_service(
        &app,
        TestRequest::get()
            .uri("/200")
            .peer_addr(peer("192.0.2.7:40000"))
            .to_request(),
    )
    .await;
    assert_eq!(ok.headers().get("x-ratelimit-remaining").unwrap(), "4");

    // The failed request is un-counted, and its own headers reflect that.
    let failed = test::call_service(
        &app,
        TestRequest::get()
            .uri("/500")
            .peer_addr(peer("192.0.2.7:40000"))
            .to_request(),
    )
    .await;
    assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(failed.headers().get("x-ratelimit-remaining").unwrap(), "4");

    let ok = test::call_service(
        &app,
        TestRequest::get()
            .uri("/200")
            .peer_addr(peer("192.0.2.7:40000"))
            .to_request(),
    )
    .await;
    assert_eq!(ok.headers().get("x-ratelimit-remaining").unwrap(), "3");
}
