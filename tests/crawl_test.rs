//! End-to-end crawl tests against the scripted browser.

use std::sync::Arc;

use feed_harvester::browser::fixture::{FeedScript, FixtureBrowser, PageScript};
use feed_harvester::browser::ObservedResponse;
use feed_harvester::cache::{CacheStore, MemoryCache};
use feed_harvester::config::Config;
use feed_harvester::constants::{QUERY_NAME_HEADER, VISION_QUEUE};
use feed_harvester::db::{self, Database, PostRecord};
use feed_harvester::discovery::{DiscoveryMode, StopReason};
use feed_harvester::harvester::{CrawlRequest, Harvester};
use feed_harvester::platform::parse_post_link;
use feed_harvester::progress::ChannelProgress;
use feed_harvester::state::CrawlStateStore;
use feed_harvester::vision::VisionClient;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BASE: &str = "https://www.threads.net";
const PROFILE: &str = "https://www.threads.net/@acme";

struct Site {
    browser: FixtureBrowser,
    cache: Arc<MemoryCache>,
    db: Database,
    _dir: TempDir,
}

async fn setup() -> Site {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = Database::new(&dir.path().join("test.sqlite"))
        .await
        .expect("Failed to create database");
    Site {
        browser: FixtureBrowser::new(),
        cache: Arc::new(MemoryCache::new()),
        db,
        _dir: dir,
    }
}

fn harvester(site: &Site, config: &Config) -> Harvester {
    Harvester::new(
        config,
        Arc::new(site.browser.clone()),
        CrawlStateStore::new(site.db.clone()),
        site.cache.clone(),
    )
    .expect("Failed to build harvester")
}

fn post_url(code: &str) -> String {
    format!("{BASE}/@acme/post/{code}")
}

fn hydrated_page(caption: &str, dom_numbers: &[&str]) -> String {
    let spans: String = dom_numbers
        .iter()
        .map(|n| format!("<span>{n}</span>"))
        .collect();
    format!(
        r#"<html><body>
            <script type="application/json" data-sjs>{{"thread_items":[]}}</script>
            <div data-pressable-container="true">
              <span dir="auto">{caption}</span>{spans}
            </div>
        </body></html>"#
    )
}

fn counts_response(code: &str, likes: i64, caption: &str) -> ObservedResponse {
    let body = json!({
        "data": { "media": {
            "code": code,
            "like_count": likes,
            "text_post_app_info": { "direct_reply_count": 4, "repost_count": 1, "reshare_count": 2 },
            "caption": { "text": caption },
        } }
    });
    let mut response = ObservedResponse {
        url: format!("{BASE}/api/graphql"),
        status: 200,
        mime_type: "application/json".to_string(),
        request_method: "POST".to_string(),
        body: Some(body.to_string()),
        ..ObservedResponse::default()
    };
    response.request_headers.insert(
        QUERY_NAME_HEADER.to_string(),
        "BarcelonaPostPageDirectQuery".to_string(),
    );
    response
}

fn install_post(browser: &FixtureBrowser, code: &str, likes: i64) {
    let caption = format!("Post {code} has its own caption");
    browser.set_page(
        post_url(code),
        PageScript::html(hydrated_page(&caption, &["999", "12"]))
            .with_response(counts_response(code, likes, &caption)),
    );
}

fn install_feed(browser: &FixtureBrowser, codes: &[&str]) {
    let links = codes.iter().map(|c| format!("/@acme/post/{c}")).collect();
    browser.set_page(PROFILE, PageScript::feed(FeedScript::new(links, 3, 3)));
}

async fn seed_post(db: &Database, code: &str) {
    let link = parse_post_link(&post_url(code), BASE).unwrap();
    let mut record = PostRecord::provisional("acme", &link);
    record.content = format!("Stored post {code}");
    db::upsert_post(db.pool(), &record).await.unwrap();
}

#[tokio::test]
async fn test_five_new_posts_before_anchor() {
    let site = setup().await;
    for code in ["OLD1", "OLD2"] {
        seed_post(&site.db, code).await;
    }
    db::advance_crawl_state(site.db.pool(), "acme", Some("acme_OLD1"), 2)
        .await
        .unwrap();

    install_feed(
        &site.browser,
        &["N1", "N2", "N3", "N4", "N5", "OLD1", "OLD2"],
    );
    for (i, code) in ["N1", "N2", "N3", "N4", "N5"].iter().enumerate() {
        install_post(&site.browser, code, 100 + i as i64);
    }

    let (progress, mut events) = ChannelProgress::new();
    let harvester = harvester(&site, &Config::for_testing()).with_progress(Arc::new(progress));
    let report = harvester
        .crawl_account(&CrawlRequest::new("acme", 5))
        .await
        .unwrap();

    assert_eq!(report.inserted, 5);
    assert_eq!(report.succeeded, 5);
    assert_eq!(report.failed, 0);
    assert_eq!(report.stop, Some(StopReason::TargetReached));
    let ids: Vec<&str> = report.records.iter().map(|r| r.post_id.as_str()).collect();
    assert_eq!(ids, vec!["acme_N1", "acme_N2", "acme_N3", "acme_N4", "acme_N5"]);

    let state = db::get_crawl_state(site.db.pool(), "acme")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.total_crawled, 7);
    assert_eq!(state.latest_post_id.as_deref(), Some("acme_N1"));

    let stored = db::get_post(site.db.pool(), "acme_N3").await.unwrap().unwrap();
    assert_eq!(stored.metrics.likes, Some(102));
    assert_eq!(stored.metrics.comments, Some(4));
    assert_eq!(stored.content, "Post N3 has its own caption");
    // Reader tiers are unreachable in this setup.
    assert_eq!(stored.metrics.views, Some(-1));
    assert_eq!(site.browser.visits(&post_url("OLD1")), 0);

    let mut stages = Vec::new();
    while let Ok(event) = events.try_recv() {
        stages.push(event.stage);
    }
    assert_eq!(stages.first().map(String::as_str), Some("started"));
    assert_eq!(stages.last().map(String::as_str), Some("done"));
    assert_eq!(stages.iter().filter(|s| *s == "extracted").count(), 5);
}

#[tokio::test]
async fn test_anchor_stops_discovery_early() {
    let site = setup().await;
    seed_post(&site.db, "OLD1").await;
    db::advance_crawl_state(site.db.pool(), "acme", Some("acme_OLD1"), 1)
        .await
        .unwrap();
    install_feed(&site.browser, &["N1", "N2", "OLD1", "OLD2", "OLD3"]);
    install_post(&site.browser, "N1", 10);
    install_post(&site.browser, "N2", 20);

    let report = harvester(&site, &Config::for_testing())
        .crawl_account(&CrawlRequest::new("acme", 5))
        .await
        .unwrap();

    assert_eq!(report.stop, Some(StopReason::AnchorReached));
    assert_eq!(report.inserted, 2);
    let state = db::get_crawl_state(site.db.pool(), "acme")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.total_crawled, 3);
    assert_eq!(state.latest_post_id.as_deref(), Some("acme_N1"));
}

#[tokio::test]
async fn test_interception_beats_dom_guess_end_to_end() {
    let site = setup().await;
    install_feed(&site.browser, &["P1"]);
    install_post(&site.browser, "P1", 120);

    let report = harvester(&site, &Config::for_testing())
        .crawl_account(&CrawlRequest::new("acme", 1))
        .await
        .unwrap();

    assert_eq!(report.records[0].metrics.likes, Some(120));
    assert_eq!(report.records[0].source, "interception");
    let stored = db::get_post(site.db.pool(), "acme_P1").await.unwrap().unwrap();
    assert_eq!(stored.metrics.likes, Some(120));
}

#[tokio::test]
async fn test_zero_requested_does_nothing() {
    let site = setup().await;
    install_feed(&site.browser, &["P1"]);
    install_post(&site.browser, "P1", 1);

    let harvester = harvester(&site, &Config::for_testing());
    for extra in [0, -3] {
        let report = harvester
            .crawl_account(&CrawlRequest::new("acme", extra))
            .await
            .unwrap();
        assert!(report.records.is_empty());
        assert_eq!(report.stop, None);
    }

    assert_eq!(site.browser.pages_opened(), 0);
    assert_eq!(site.browser.total_visits(), 0);
    assert!(db::get_crawl_state(site.db.pool(), "acme")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_failed_post_is_kept_with_sentinels_and_logged() {
    let site = setup().await;
    install_feed(&site.browser, &["GOOD", "GONE"]);
    install_post(&site.browser, "GOOD", 5);

    let report = harvester(&site, &Config::for_testing())
        .crawl_account(&CrawlRequest::new("acme", 2))
        .await
        .unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.inserted, 2);

    let gone = db::get_post(site.db.pool(), "acme_GONE").await.unwrap().unwrap();
    assert_eq!(gone.metrics.likes, Some(-1));
    assert_eq!(gone.metrics.views, Some(-1));

    let log = db::get_processing_log(site.db.pool(), &post_url("GONE"))
        .await
        .unwrap();
    let extract = log.iter().find(|e| e.stage == "extract").unwrap();
    assert_eq!(extract.status, "failed");
    assert!(extract.metadata.as_deref().unwrap().contains("transient"));
    assert_eq!(site.browser.open_pages(), 0);
}

#[tokio::test]
async fn test_near_duplicate_collapses_to_main_post() {
    let site = setup().await;
    install_feed(&site.browser, &["REPLY", "MAIN"]);
    let caption = "Big announcement: we are shipping the new release today";
    site.browser.set_page(
        post_url("REPLY"),
        PageScript::html(hydrated_page(caption, &[]))
            .with_response(counts_response("REPLY", 3, caption)),
    );
    site.browser.set_page(
        post_url("MAIN"),
        PageScript::html(hydrated_page(caption, &[]))
            .with_response(counts_response("MAIN", 900, caption)),
    );

    let report = harvester(&site, &Config::for_testing())
        .crawl_account(&CrawlRequest::new("acme", 2))
        .await
        .unwrap();

    assert_eq!(report.duplicates, 1);
    assert_eq!(report.records.len(), 1);
    assert_eq!(report.records[0].post_id, "acme_MAIN");
    assert!(db::get_post(site.db.pool(), "acme_REPLY")
        .await
        .unwrap()
        .is_none());
    // The cursor points at a stored post, not the dropped duplicate.
    let state = db::get_crawl_state(site.db.pool(), "acme")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.latest_post_id.as_deref(), Some("acme_MAIN"));
}

#[tokio::test]
async fn test_backfill_keeps_cursor() {
    let site = setup().await;
    seed_post(&site.db, "N1").await;
    db::advance_crawl_state(site.db.pool(), "acme", Some("acme_N1"), 1)
        .await
        .unwrap();
    install_feed(&site.browser, &["N0", "N1", "B1", "B2"]);
    install_post(&site.browser, "B1", 7);
    install_post(&site.browser, "B2", 8);

    let report = harvester(&site, &Config::for_testing())
        .crawl_account(
            &CrawlRequest::new("acme", 2).with_mode(DiscoveryMode::HistoricalBackfill),
        )
        .await
        .unwrap();

    let ids: Vec<&str> = report.records.iter().map(|r| r.post_id.as_str()).collect();
    assert_eq!(ids, vec!["acme_B1", "acme_B2"]);
    assert_eq!(site.browser.visits(&post_url("N0")), 0);
    let state = db::get_crawl_state(site.db.pool(), "acme")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.latest_post_id.as_deref(), Some("acme_N1"));
    assert_eq!(state.total_crawled, 3);
}

#[tokio::test]
async fn test_views_and_missing_caption_from_reader_tiers() {
    let site = setup().await;
    let reader = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("Title: acme on Threads\n\nA caption only the reader saw\n1.2萬次瀏覽"),
        )
        .mount(&reader)
        .await;

    install_feed(&site.browser, &["Q1"]);
    // Counts arrive, but neither the API nor the DOM carries a caption.
    let mut response = counts_response("Q1", 50, "");
    response.body = Some(
        json!({ "data": { "media": { "code": "Q1", "like_count": 50 } } }).to_string(),
    );
    site.browser.set_page(
        post_url("Q1"),
        PageScript::html(
            r#"<html><body><script type="application/json" data-sjs>{}</script>
               <div data-pressable-container="true"><span>50</span></div></body></html>"#,
        )
        .with_response(response),
    );

    let config = Config {
        local_reader_url: reader.uri(),
        remote_reader_url: reader.uri(),
        ..Config::for_testing()
    };
    let report = harvester(&site, &config)
        .crawl_account(&CrawlRequest::new("acme", 1))
        .await
        .unwrap();

    let record = &report.records[0];
    assert_eq!(record.metrics.views, Some(12_000));
    assert!(record.views_fetched_at.is_some());
    assert!(record.content.contains("A caption only the reader saw"));
}

#[tokio::test]
async fn test_missing_engagement_goes_through_vision_queue() {
    let site = setup().await;
    install_feed(&site.browser, &["V1"]);
    site.browser.set_page(
        post_url("V1"),
        PageScript::html(hydrated_page("A post with nothing readable", &[])),
    );

    let harvester = harvester(&site, &Config::for_testing());
    let report = harvester
        .crawl_account(&CrawlRequest::new("acme", 1))
        .await
        .unwrap();
    assert_eq!(report.needs_escalation, 1);
    assert_eq!(site.cache.len(VISION_QUEUE).await.unwrap(), 1);
    let stored = db::get_post(site.db.pool(), "acme_V1").await.unwrap().unwrap();
    assert_eq!(stored.metrics.likes, Some(-1));

    let vision_api = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "{\"likes\": \"1.5K\", \"comments\": 8, \"reposts\": null, \"shares\": 0, \"views\": null}" } }]
        })))
        .expect(1)
        .mount(&vision_api)
        .await;
    let vision = VisionClient::new(
        format!("{}/v1/chat/completions", vision_api.uri()),
        Some("key".to_string()),
        "test-model",
        std::time::Duration::from_secs(5),
    )
    .unwrap();

    let harvester = harvester.with_vision(vision);
    let drained = harvester.drain_vision_queue(10).await.unwrap();
    assert_eq!(drained.processed, 1);
    assert_eq!(drained.filled, 1);
    assert_eq!(site.cache.len(VISION_QUEUE).await.unwrap(), 0);

    let stored = db::get_post(site.db.pool(), "acme_V1").await.unwrap().unwrap();
    assert_eq!(stored.metrics.likes, Some(1500));
    assert_eq!(stored.metrics.comments, Some(8));
    assert_eq!(stored.metrics.shares, Some(0));
    assert_eq!(stored.metrics.reposts, Some(-1));
}

#[tokio::test]
async fn test_vision_drain_disabled_leaves_queue() {
    let site = setup().await;
    site.cache.push(VISION_QUEUE, "{}").await.unwrap();

    let report = harvester(&site, &Config::for_testing())
        .drain_vision_queue(10)
        .await
        .unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(site.cache.len(VISION_QUEUE).await.unwrap(), 1);
}

#[tokio::test]
async fn test_refresh_raises_stored_metrics_only() {
    let site = setup().await;
    let link = parse_post_link(&post_url("R1"), BASE).unwrap();
    let mut record = PostRecord::provisional("acme", &link);
    record.metrics.likes = Some(500);
    record.metrics.comments = Some(1);
    db::upsert_post(site.db.pool(), &record).await.unwrap();

    install_post(&site.browser, "R1", 300);
    let report = harvester(&site, &Config::for_testing())
        .refresh_metrics(&[post_url("R1"), post_url("UNSEEN")])
        .await
        .unwrap();

    assert_eq!(report.refreshed, 1);
    assert_eq!(report.failed, 1);
    let stored = db::get_post(site.db.pool(), "acme_R1").await.unwrap().unwrap();
    assert_eq!(stored.metrics.likes, Some(500));
    assert_eq!(stored.metrics.comments, Some(4));
    assert!(site.browser.max_open_pages() <= 2);
}

fn vision_client(server: &MockServer) -> VisionClient {
    VisionClient::new(
        format!("{}/v1/chat/completions", server.uri()),
        Some("key".to_string()),
        "test-model",
        std::time::Duration::from_secs(5),
    )
    .unwrap()
}

#[tokio::test]
async fn test_partial_engagement_is_queued_for_vision() {
    let site = setup().await;
    install_feed(&site.browser, &["L1"]);
    let mut response = counts_response("L1", 42, "Only likes came back");
    response.body = Some(
        json!({ "data": { "media": { "code": "L1", "like_count": 42 } } }).to_string(),
    );
    site.browser.set_page(
        post_url("L1"),
        PageScript::html(hydrated_page("Only likes came back", &[])).with_response(response),
    );

    let report = harvester(&site, &Config::for_testing())
        .crawl_account(&CrawlRequest::new("acme", 1))
        .await
        .unwrap();

    assert_eq!(report.succeeded, 0);
    assert_eq!(report.needs_escalation, 1);
    assert_eq!(site.cache.len(VISION_QUEUE).await.unwrap(), 1);
    let queued = site.cache.pop(VISION_QUEUE).await.unwrap().unwrap();
    assert!(queued.contains("comments"));
    assert!(!queued.contains("likes"));

    let stored = db::get_post(site.db.pool(), "acme_L1").await.unwrap().unwrap();
    assert_eq!(stored.metrics.likes, Some(42));
    assert_eq!(stored.metrics.comments, Some(-1));
}

#[tokio::test]
async fn test_vision_reply_without_missing_counts_fills_nothing() {
    let site = setup().await;
    install_feed(&site.browser, &["V2"]);
    site.browser.set_page(
        post_url("V2"),
        PageScript::html(hydrated_page("Still nothing readable here", &[])),
    );
    let harvester = harvester(&site, &Config::for_testing());
    harvester
        .crawl_account(&CrawlRequest::new("acme", 1))
        .await
        .unwrap();
    assert_eq!(site.cache.len(VISION_QUEUE).await.unwrap(), 1);

    let vision_api = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "{\"likes\": null, \"comments\": null, \"reposts\": null, \"shares\": null, \"views\": 5000}" } }]
        })))
        .expect(1)
        .mount(&vision_api)
        .await;

    let drained = harvester
        .with_vision(vision_client(&vision_api))
        .drain_vision_queue(10)
        .await
        .unwrap();
    assert_eq!(drained.processed, 1);
    assert_eq!(drained.filled, 0);
    assert_eq!(drained.failed, 0);

    let stored = db::get_post(site.db.pool(), "acme_V2").await.unwrap().unwrap();
    assert_eq!(stored.metrics.likes, Some(-1));
    assert_eq!(stored.metrics.views, Some(5000));
}
