// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Elasticsearch.

use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Single-node Elasticsearch with security off.
pub fn elasticsearch_container<'a>(docker: &'a Cli, tag: &str) -> Container<'a, GenericImage> {
    let image = GenericImage::new("docker.elastic.co/elasticsearch/elasticsearch", tag)
        .with_exposed_port(9200)
        .with_env_var("discovery.type", "single-node")
        .with_env_var("xpack.security.enabled", "false")
        .with_env_var("ES_JAVA_OPTS", "-Xms512m -Xmx512m")
        .with_wait_for(WaitFor::message_on_stdout("\"started\""));
    docker.run(image)
}

/// Base URL for a container.
pub fn elasticsearch_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(9200);
    format!("http://127.0.0.1:{}", port)
}

/// Index documents directly over HTTP and refresh, bypassing the crate.
pub async fn seed_documents(url: &str, index: &str, docs: &[(String, serde_json::Value)]) {
    let mut body = String::new();
    for (id, doc) in docs {
        body.push_str(&serde_json::json!({ "index": { "_index": index, "_id": id } }).to_string());
        body.push('\n');
        body.push_str(&doc.to_string());
        body.push('\n');
    }
    let client = reqwest::Client::new();
    if !body.is_empty() {
        let response = client
            .post(format!("{}/_bulk?refresh=true", url))
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .expect("seed bulk request");
        assert!(response.status().is_success(), "seed failed: {}", response.status());
    } else {
        client
            .put(format!("{}/{}", url, index))
            .send()
            .await
            .expect("create index");
    }
}

/// Fetch `_source` of every document in `index`, sorted by id.
pub async fn fetch_all(url: &str, index: &str) -> Vec<(String, serde_json::Value)> {
    let client = reqwest::Client::new();
    client
        .post(format!("{}/{}/_refresh", url, index))
        .send()
        .await
        .expect("refresh");
    let body: serde_json::Value = client
        .post(format!("{}/{}/_search", url, index))
        .json(&serde_json::json!({ "size": 10000, "sort": [{ "_id": "asc" }] }))
        .send()
        .await
        .expect("search")
        .json()
        .await
        .expect("search body");
    body["hits"]["hits"]
        .as_array()
        .map(|hits| {
            hits.iter()
                .map(|h| (h["_id"].as_str().unwrap_or_default().to_string(), h["_source"].clone()))
                .collect()
        })
        .unwrap_or_default()
}
