//! HTTP behaviour of the GBIF client against a mock server.

use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use taxa_core::{OccurrenceQuery, Rank, RegistryClient, TaxonomicStatus};
use taxa_registry::{GbifClient, RegistryConfig};

fn client(server: &MockServer) -> GbifClient {
    GbifClient::new(
        RegistryConfig::default()
            .with_base_url(server.uri())
            .with_children_limit(2),
    )
    .expect("client")
}

fn usage(key: i64, name: &str, rank: &str, parent: Option<i64>) -> serde_json::Value {
    json!({
        "key": key,
        "nubKey": key,
        "parentKey": parent,
        "scientificName": name,
        "canonicalName": name,
        "taxonomicStatus": "ACCEPTED",
        "rank": rank
    })
}

#[tokio::test]
async fn test_get_by_key_maps_404_to_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/species/999"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let result = client(&server).get_by_key(999).await.expect("404 is not an error");
    assert!(result.is_none());
}

#[tokio::test]
async fn test_server_error_is_registry_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/species/5"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = client(&server).get_by_key(5).await.unwrap_err();
    assert!(err.to_string().contains("503"), "unexpected error: {}", err);
}

#[tokio::test]
async fn test_search_by_name_follows_match_to_usage() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/species/match"))
        .and(query_param("name", "Panthera tigris"))
        .and(query_param("rank", "SPECIES"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "usageKey": 100,
            "matchType": "EXACT",
            "rank": "SPECIES"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/species/100"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(usage(100, "Panthera tigris", "SPECIES", Some(50))),
        )
        .mount(&server)
        .await;

    let record = client(&server)
        .search_by_name("Panthera tigris", Some(Rank::Species))
        .await
        .expect("search")
        .expect("found");
    assert_eq!(record.key, 100);
    assert_eq!(record.parent_key, Some(50));
    assert_eq!(record.taxonomic_status, TaxonomicStatus::Accepted);
}

#[tokio::test]
async fn test_match_type_none_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/species/match"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "matchType": "NONE",
            "confidence": 100
        })))
        .mount(&server)
        .await;

    let result = client(&server)
        .search_by_name("Nonexistus fictus", None)
        .await
        .expect("search");
    assert!(result.is_none());
}

#[tokio::test]
async fn test_suggest_picks_first_suggestion_at_rank() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/species/suggest"))
        .and(query_param("q", "Panthra"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "key": 7, "rank": "SPECIES" },
            { "key": 50, "rank": "GENUS" }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/species/50"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(usage(50, "Panthera", "GENUS", Some(1))),
        )
        .mount(&server)
        .await;

    let record = client(&server)
        .suggest_by_name("Panthra", Some(Rank::Genus))
        .await
        .expect("suggest")
        .expect("found");
    assert_eq!(record.key, 50);
    assert_eq!(record.rank, Rank::Genus);
}

#[tokio::test]
async fn test_list_children_pages_until_end_of_records() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/species/50/children"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "offset": 0,
            "limit": 2,
            "endOfRecords": false,
            "results": [
                usage(100, "Panthera tigris", "SPECIES", Some(50)),
                { "key": 101, "scientificName": "Panthera ?", "rank": "UNRANKED", "taxonomicStatus": "DOUBTFUL" }
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/species/50/children"))
        .and(query_param("offset", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "offset": 2,
            "limit": 2,
            "endOfRecords": true,
            "results": [usage(102, "Panthera leo", "SPECIES", Some(50))]
        })))
        .mount(&server)
        .await;

    let children = client(&server).list_children(50).await.expect("children");
    let keys: Vec<i64> = children.iter().map(|c| c.key).collect();
    assert_eq!(keys, vec![100, 102], "malformed child skipped");
}

#[tokio::test]
async fn test_vernacular_names() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/species/100/vernacularNames"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "offset": 0,
            "limit": 1000,
            "endOfRecords": true,
            "results": [
                { "vernacularName": "Tiger", "language": "eng", "source": "Catalogue of Life" },
                { "vernacularName": "", "language": "deu" }
            ]
        })))
        .mount(&server)
        .await;

    let names = client(&server).get_vernacular_names(100).await.expect("names");
    assert_eq!(names.len(), 1);
    assert_eq!(names[0].name, "Tiger");
    assert_eq!(names[0].language.as_deref(), Some("eng"));
}

#[tokio::test]
async fn test_occurrence_search_sends_filters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/occurrence/search"))
        .and(query_param("taxonKey", "100"))
        .and(query_param("offset", "20"))
        .and(query_param("limit", "20"))
        .and(query_param("hasCoordinate", "true"))
        .and(query_param("hasGeospatialIssue", "false"))
        .and(query_param("country", "ZA"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "offset": 20,
            "limit": 20,
            "endOfRecords": true,
            "count": 21,
            "results": [{
                "key": 4242,
                "decimalLongitude": 30.0,
                "decimalLatitude": -25.0,
                "eventDate": "2020-01-01"
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let page = client(&server)
        .search_occurrences(&OccurrenceQuery {
            taxon_key: 100,
            offset: 20,
            limit: 20,
            country: Some("ZA".to_string()),
        })
        .await
        .expect("page");
    assert_eq!(page.total, 21);
    assert!(page.end_of_records);
    assert_eq!(page.results[0].upstream_id.as_deref(), Some("4242"));
}

#[tokio::test]
async fn test_occurrence_search_transport_failure_is_error() {
    // Nothing listens on this port.
    let client = GbifClient::new(
        RegistryConfig::default()
            .with_base_url("http://127.0.0.1:9")
            .with_timeout_secs(2),
    )
    .expect("client");

    let result = client
        .search_occurrences(&OccurrenceQuery {
            taxon_key: 1,
            offset: 0,
            limit: 20,
            country: None,
        })
        .await;
    assert!(result.is_err());
}
