mod common;

use common::{TestApp, User};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use uuid::Uuid;

async fn completed_booking(app: &TestApp, customer: &User, provider: &User) -> Uuid {
    let service_id = app.seed_service(provider, dec!(60.00));
    let booking_id = app.booking_id(customer, service_id).await;
    app.set_status(provider, booking_id, "confirmed").await;
    let response = app.set_status(provider, booking_id, "completed").await;
    assert_eq!(response.status().as_u16(), 200);
    booking_id
}

#[tokio::test]
async fn provider_rating_starts_empty() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(format!("{}/providers/{}/rating", app.address, Uuid::new_v4()))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status().as_u16(), 200);

    let body: Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["count"], 0);
    assert_eq!(body["average_rating"], 0.0);

    app.shutdown();
}

#[tokio::test]
async fn concurrent_feedback_is_aggregated_without_losses() {
    let app = TestApp::spawn().await;
    let provider = User::provider();
    let scores = [5u8, 4, 3, 5, 2, 5];

    let mut submissions = Vec::new();
    for score in scores {
        let customer = User::customer();
        let booking_id = completed_booking(&app, &customer, &provider).await;
        submissions.push((customer, booking_id, score));
    }

    let requests = submissions.iter().map(|(customer, booking_id, score)| {
        app.post(&format!("/bookings/{}/feedback", booking_id), customer)
            .json(&json!({ "rating": score, "review": "" }))
            .send()
    });
    for response in futures::future::join_all(requests).await {
        let response = response.expect("Failed to execute request");
        assert_eq!(response.status().as_u16(), 200);
    }

    let rating: Value = app
        .client
        .get(format!("{}/providers/{}/rating", app.address, provider.id))
        .send()
        .await
        .expect("Failed to execute request")
        .json()
        .await
        .expect("Failed to parse JSON");
    assert_eq!(rating["count"], scores.len());
    assert_eq!(rating["average_rating"], 4.0);

    let mut rated: Vec<String> = rating["ratings"]
        .as_array()
        .expect("ratings")
        .iter()
        .filter_map(|r| r["booking_id"].as_str().map(str::to_string))
        .collect();
    rated.sort();
    let mut expected: Vec<String> = submissions.iter().map(|(_, id, _)| id.to_string()).collect();
    expected.sort();
    assert_eq!(rated, expected);

    app.shutdown();
}
