use std::path::Path;
use std::sync::Arc;

use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::{json_encoded, status_code};
use httptest::{Expectation, Server};
use parking_lot::Mutex;
use secrecy::SecretString;
use serde_json::json;
use tempfile::tempdir;

use restaurant_onboarding::{
    bootstrap, create_client, location_exists, AppConfig, AppError, CandidateLocation,
    GeocodeOutcome, Geocoder, GeocodingClient, IngestionPipeline, LocationKey, NewClient,
    NominatimGeocoder, OnboardingService,
};

fn test_config(server: &Server, data_dir: &Path) -> AppConfig {
    AppConfig {
        data_dir: data_dir.to_path_buf(),
        database_file_name: "onboarding.db".into(),
        geocoder_base_url: server.url("/").to_string(),
        geocoder_rate_limit_qps: 20,
        geocoder_max_attempts: 3,
        geocoder_base_backoff_ms: 1,
        job_retry_delay_ms: 1,
        ..AppConfig::default()
    }
}

fn new_client(siren: &str, restaurants: Vec<CandidateLocation>) -> NewClient {
    NewClient {
        name: "Client Test".into(),
        siren: siren.into(),
        contact: "John Doe".into(),
        email: format!("{siren}@example.com"),
        phone: "123-456-7890".into(),
        restaurants: Some(restaurants),
    }
}

fn main_street() -> CandidateLocation {
    CandidateLocation::new("1 Main St", "10001", "NYC", "US")
}

fn oak_avenue() -> CandidateLocation {
    CandidateLocation::new("2 Oak Ave", "20002", "DC", "US")
}

fn elm_road() -> CandidateLocation {
    CandidateLocation::new("3 Elm Rd", "30003", "Atlanta", "US")
}

#[tokio::test]
async fn registration_ingests_restaurants_in_background() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("street", "1 Main St")))),
            request::query(url_decoded(contains(("postalcode", "10001")))),
            request::query(url_decoded(contains(("city", "NYC")))),
            request::query(url_decoded(contains(("country", "US")))),
        ))
        .respond_with(json_encoded(json!([
            { "lat": "40.7", "lon": "-74.0", "display_name": "1 Main St, New York" },
            { "lat": "40.9", "lon": "-73.8", "display_name": "1 Main St, Yonkers" }
        ]))),
    );
    server.expect(
        Expectation::matching(all_of!(
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("street", "2 Oak Ave")))),
        ))
        .respond_with(json_encoded(json!([]))),
    );
    server.expect(
        Expectation::matching(all_of!(
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("street", "3 Elm Rd")))),
        ))
        .times(3)
        .respond_with(status_code(503)),
    );

    let dir = tempdir().unwrap();
    let config = test_config(&server, dir.path());
    let mut service = OnboardingService::initialize(config).expect("service");

    let registration = service
        .register_client(new_client(
            "123456789",
            vec![main_street(), main_street(), oak_avenue(), elm_road()],
        ))
        .expect("registration");
    assert_eq!(
        registration.message,
        "Customer Client Test with SIREN 123456789 added successfully. Restaurants are currently being added."
    );
    assert_eq!(registration.restaurants_queued, 4);

    service.shutdown().await;

    let stored = service.locations_for(registration.client.id).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].route, "1 Main St");
    assert_eq!((stored[0].latitude, stored[0].longitude), (40.7, -74.0));

    let conn = bootstrap(dir.path(), "onboarding.db").unwrap().connection;
    let (inserted, skipped, failed): (i64, i64, i64) = conn
        .query_row(
            "SELECT inserted, skipped, failed FROM ingestion_runs WHERE client_id = ?1",
            [registration.client.id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .unwrap();
    assert_eq!((inserted, skipped, failed), (1, 2, 1));
    assert!(service.db_path().ends_with("onboarding.db"));
    assert_eq!(
        service.find_client(registration.client.id).unwrap(),
        Some(registration.client.clone())
    );
    assert!(service.find_client(registration.client.id + 1).unwrap().is_none());
    assert!(!service.public_config().has_geocoder_api_key);
}

#[tokio::test]
async fn duplicate_siren_is_rejected_without_queueing() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/search"))
            .respond_with(json_encoded(json!([{ "lat": "38.9", "lon": "-77.0" }]))),
    );

    let dir = tempdir().unwrap();
    let mut service = OnboardingService::initialize(test_config(&server, dir.path())).unwrap();
    service
        .register_client(new_client("555", vec![oak_avenue()]))
        .unwrap();

    let mut again = new_client("555", vec![main_street()]);
    again.email = "someone-else@example.com".into();
    let err = service.register_client(again).unwrap_err();
    assert!(matches!(err, AppError::Conflict(ref msg) if msg == "The siren has already been taken."));

    service.shutdown().await;
    assert_eq!(service.list_clients().unwrap().len(), 1);
}

#[tokio::test]
async fn second_run_skips_without_calling_the_geocoder() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("street", "2 Oak Ave")))),
        ))
        .times(1)
        .respond_with(json_encoded(json!([{ "lat": "38.9", "lon": "-77.0" }]))),
    );

    let dir = tempdir().unwrap();
    let config = test_config(&server, dir.path());
    let mut conn = bootstrap(dir.path(), "runs.db").unwrap().connection;
    let client = create_client(&mut conn, &new_client("777", Vec::new())).unwrap();
    let db = Arc::new(Mutex::new(conn));
    let oak = oak_avenue();
    assert!(!location_exists(&db.lock(), &LocationKey::new(client.id, &oak)).unwrap());

    let geocoder: Arc<dyn Geocoder> = Arc::new(NominatimGeocoder::new(&config).unwrap());
    let pipeline =
        IngestionPipeline::new(db.clone(), GeocodingClient::new(geocoder, &config), 1);

    let first = pipeline.run(&client, &[oak_avenue()], None).await.unwrap();
    let second = pipeline.run(&client, &[oak_avenue()], None).await.unwrap();

    assert_eq!((first.inserted, first.skipped), (1, 0));
    assert_eq!((second.inserted, second.skipped), (0, 1));
    assert!(location_exists(&db.lock(), &LocationKey::new(client.id, &oak)).unwrap());
}

#[tokio::test]
async fn nominatim_sends_credentials_and_reads_first_result() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("key", "secret-key")))),
            request::query(url_decoded(contains(("format", "jsonv2")))),
            request::headers(contains(("user-agent", "onboarding-tests/1.0"))),
        ))
        .respond_with(json_encoded(json!([
            { "lat": "48.8606", "lon": "2.3376" },
            { "lat": "0", "lon": "0" }
        ]))),
    );

    let dir = tempdir().unwrap();
    let config = AppConfig {
        geocoder_api_key: Some(SecretString::from("secret-key".to_string())),
        geocoder_user_agent: "onboarding-tests/1.0".into(),
        ..test_config(&server, dir.path())
    };
    let geocoder = NominatimGeocoder::new(&config).unwrap();

    let outcome = geocoder
        .geocode(&CandidateLocation::new("Rue de Rivoli", "75001", "Paris", "France"))
        .await
        .unwrap();
    match outcome {
        GeocodeOutcome::Located(coords) => {
            assert_eq!((coords.latitude, coords.longitude), (48.8606, 2.3376));
        }
        other => panic!("expected coordinates, got {other:?}"),
    }
}

#[tokio::test]
async fn nominatim_distinguishes_misses_from_failures() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("street", "empty")))),
        ))
        .respond_with(json_encoded(json!([]))),
    );
    server.expect(
        Expectation::matching(all_of!(
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("street", "partial")))),
        ))
        .respond_with(json_encoded(json!([{ "lat": "48.8", "display_name": "somewhere" }]))),
    );
    server.expect(
        Expectation::matching(all_of!(
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("street", "garbled")))),
        ))
        .respond_with(status_code(200).body("<html>not json</html>")),
    );
    server.expect(
        Expectation::matching(all_of!(
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("street", "limited")))),
        ))
        .respond_with(status_code(429)),
    );

    let dir = tempdir().unwrap();
    let geocoder = NominatimGeocoder::new(&test_config(&server, dir.path())).unwrap();
    let address = |street: &str| CandidateLocation::new(street, "00000", "Nowhere", "Atlantis");

    assert_eq!(
        geocoder.geocode(&address("empty")).await.unwrap(),
        GeocodeOutcome::NotFound
    );
    assert_eq!(
        geocoder.geocode(&address("partial")).await.unwrap(),
        GeocodeOutcome::Incomplete
    );
    assert!(matches!(
        geocoder.geocode(&address("garbled")).await,
        Err(AppError::Http(_))
    ));
    assert!(matches!(
        geocoder.geocode(&address("limited")).await,
        Err(AppError::Geocoder(_))
    ));
}
