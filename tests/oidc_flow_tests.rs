//! The whole relying-party journey end to end: discover the issuer, run the
//! authorization code flow with PKCE, verify the signed tokens against the
//! published JWKS, and keep the session alive through a refresh.

mod common;

use std::collections::HashMap;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use http_body_util::BodyExt;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use pretty_assertions::assert_eq;
use serde_json::Value;
use tower::ServiceExt;
use url::Url;

use common::{PKCE_CHALLENGE, PKCE_VERIFIER, REDIRECT_URI, router};

const NONCE: &str = "n-0S6_WzA2Mj";
const STATE: &str = "af0ifjsldkj";

async fn get(app: Router, uri: &str) -> Response<Body> {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn json_body(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn post_token(app: Router, form: &[(&str, &str)]) -> Response<Body> {
    let body = serde_urlencoded::to_string(form).unwrap();
    app.oneshot(
        Request::builder()
            .method("POST")
            .uri("/token")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(
                header::AUTHORIZATION,
                format!("Basic {}", STANDARD.encode("client_id:client_secret")),
            )
            .body(Body::from(body))
            .unwrap(),
    )
    .await
    .unwrap()
}

async fn userinfo(app: Router, access_token: &str) -> Response<Body> {
    app.oneshot(
        Request::builder()
            .uri("/userinfo")
            .header(header::AUTHORIZATION, format!("Bearer {access_token}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await
    .unwrap()
}

/// Verify a compact JWT against the issuer's published JWKS.
fn verify_against_jwks(jwks: &Value, token: &str, issuer: &str) -> Value {
    let jwk = &jwks["keys"][0];
    let key =
        DecodingKey::from_rsa_components(jwk["n"].as_str().unwrap(), jwk["e"].as_str().unwrap())
            .unwrap();
    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_audience(&["client_id"]);
    validation.set_issuer(&[issuer]);
    decode::<Value>(token, &key, &validation).unwrap().claims
}

#[tokio::test]
async fn complete_relying_party_journey() {
    let (app, engine, identity) = router();
    let sub = identity.account().account_id.clone();

    // 1. Discover the issuer and fetch its keys.
    let discovery = json_body(get(app.clone(), "/.well-known/openid-configuration").await).await;
    assert_eq!(discovery["issuer"], engine.issuer.as_str());
    let jwks = json_body(get(app.clone(), "/jwks").await).await;

    // 2. Send the user agent to /authorize with state, nonce, and PKCE.
    let authorize = format!(
        "/authorize?{}",
        serde_urlencoded::to_string([
            ("client_id", "client_id"),
            ("redirect_uri", REDIRECT_URI),
            ("response_type", "code"),
            ("scope", "openid"),
            ("state", STATE),
            ("nonce", NONCE),
            ("code_challenge", PKCE_CHALLENGE),
            ("code_challenge_method", "S256"),
        ])
        .unwrap()
    );
    let parked = get(app.clone(), &authorize).await;
    assert_eq!(parked.status(), StatusCode::SEE_OTHER);

    // 3. Follow the redirect into the interaction endpoint; the auto-approve
    //    broker logs the synthetic account in and sends us to the callback.
    let interaction_path = parked.headers()[header::LOCATION].to_str().unwrap().to_string();
    let resolved = get(app.clone(), &interaction_path).await;
    assert_eq!(resolved.status(), StatusCode::SEE_OTHER);

    let callback = Url::parse(resolved.headers()[header::LOCATION].to_str().unwrap()).unwrap();
    assert!(callback.as_str().starts_with(REDIRECT_URI));
    let query: HashMap<_, _> = callback.query_pairs().collect();
    assert_eq!(query["state"], STATE);
    let code = query["code"].to_string();

    // 4. Exchange the code on the back channel, proving the PKCE verifier.
    let exchanged = post_token(
        app.clone(),
        &[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", REDIRECT_URI),
            ("code_verifier", PKCE_VERIFIER),
        ],
    )
    .await;
    assert_eq!(exchanged.status(), StatusCode::OK);
    let tokens = json_body(exchanged).await;

    // 5. Verify both signed tokens against the published JWKS.
    let id_claims = verify_against_jwks(
        &jwks,
        tokens["id_token"].as_str().unwrap(),
        &engine.issuer,
    );
    assert_eq!(id_claims["sub"], sub.as_str());
    assert_eq!(id_claims["nonce"], NONCE);
    assert_eq!(id_claims["email"], identity.account().email.as_str());

    let access_claims = verify_against_jwks(
        &jwks,
        tokens["access_token"].as_str().unwrap(),
        &engine.issuer,
    );
    assert_eq!(access_claims["sub"], sub.as_str());
    assert_eq!(access_claims["scope"], "openid");

    // 6. The userinfo endpoint agrees on the subject.
    let info = userinfo(app.clone(), tokens["access_token"].as_str().unwrap()).await;
    assert_eq!(info.status(), StatusCode::OK);
    let info = json_body(info).await;
    assert_eq!(info["sub"], sub.as_str());

    // 7. Refresh, and both the new tokens and userinfo still name the same
    //    single identity: the provider only ever knows one account.
    let refreshed = post_token(
        app.clone(),
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", tokens["refresh_token"].as_str().unwrap()),
        ],
    )
    .await;
    assert_eq!(refreshed.status(), StatusCode::OK);
    let refreshed = json_body(refreshed).await;

    let refreshed_claims = verify_against_jwks(
        &jwks,
        refreshed["access_token"].as_str().unwrap(),
        &engine.issuer,
    );
    assert_eq!(refreshed_claims["sub"], sub.as_str());

    let info = json_body(userinfo(app, refreshed["access_token"].as_str().unwrap()).await).await;
    assert_eq!(info["sub"], sub.as_str());
}

#[tokio::test]
async fn every_login_yields_the_same_subject() {
    // Two full logins, hours of wall-clock apart in a real deployment,
    // must authenticate the same synthetic account.
    let (app, _, identity) = router();
    let mut subjects = Vec::new();

    for _ in 0..2 {
        let authorize = format!(
            "/authorize?{}",
            serde_urlencoded::to_string([
                ("client_id", "client_id"),
                ("redirect_uri", REDIRECT_URI),
                ("response_type", "code"),
                ("scope", "openid"),
            ])
            .unwrap()
        );
        let parked = get(app.clone(), &authorize).await;
        let interaction = parked.headers()[header::LOCATION].to_str().unwrap().to_string();
        let resolved = get(app.clone(), &interaction).await;
        let callback =
            Url::parse(resolved.headers()[header::LOCATION].to_str().unwrap()).unwrap();
        let query: HashMap<_, _> = callback.query_pairs().collect();
        let code = query["code"].to_string();

        let tokens = json_body(
            post_token(
                app.clone(),
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code.as_str()),
                    ("redirect_uri", REDIRECT_URI),
                ],
            )
            .await,
        )
        .await;
        let info = json_body(userinfo(app.clone(), tokens["access_token"].as_str().unwrap()).await)
            .await;
        subjects.push(info["sub"].as_str().unwrap().to_string());
    }

    assert_eq!(subjects[0], subjects[1]);
    assert_eq!(subjects[0], identity.account().account_id);
}
