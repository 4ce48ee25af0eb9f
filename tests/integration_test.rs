use csv_insight::column_resolver::{Role, SynonymTable};
use csv_insight::config::{LlmConfig, RoutingPolicy, SessionConfig};
use csv_insight::intent::{ChartKind, QueryIntent, VisualizeRequest};
use csv_insight::llm::{ModelBackend, OllamaBridge};
use csv_insight::session::NO_DATASET_MESSAGE;
use csv_insight::visualization::{ChartData, VisualizationBuilder, OTHER_LABEL};
use csv_insight::{AnswerSource, InsightError, Session};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

const HOMES_CSV: &str = "\
id,Region,Price,Sq_Ft,Bedrooms,Property_Type
1,North,250000,1200,2,Condo
2,South,320000,1800,4,House
3,North,410000,2200,5,House
4,East,180000,900,1,Condo
5,West,500000,2600,4,House
6,South,275000,1500,3,Townhouse
7,East,390000,2100,4,House
8,West,450000,2400,5,House
";

fn write_csv(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

fn offline_session() -> Session {
    let config = SessionConfig {
        routing: RoutingPolicy::Offline,
        ..SessionConfig::default()
    };
    Session::new(config, Arc::new(SynonymTable::default()), None)
}

fn homes_session(dir: &Path) -> Session {
    let mut session = offline_session();
    session.load_file(write_csv(dir, "homes.csv", HOMES_CSV)).unwrap();
    session
}

#[test]
fn test_size_header_variants_share_a_role() {
    let dir = tempfile::tempdir().unwrap();
    for header in ["Sq_Ft", "square_feet", "SIZE"] {
        let mut session = offline_session();
        let content = format!("Region,{}\nNorth,1200\nSouth,900\n", header);
        session
            .load_file(write_csv(dir.path(), "sizes.csv", &content))
            .unwrap();
        assert_eq!(session.roles().get(Role::Size), Some(header));
    }
}

#[tokio::test]
async fn test_average_over_three_rows() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = offline_session();
    session
        .load_file(write_csv(dir.path(), "prices.csv", "price\n100\n200\n300\n"))
        .unwrap();

    let answer = session.ask("What is the average price?").await.unwrap();
    assert_eq!(answer.text, "average price: 200.00");
    assert_eq!(answer.source, AnswerSource::Fallback);
}

#[tokio::test]
async fn test_bedroom_filter_counts_matches() {
    let dir = tempfile::tempdir().unwrap();
    let session = homes_session(dir.path());

    let answer = session.ask("show homes with more than 3 bedrooms").await.unwrap();
    assert!(answer.text.starts_with("5 rows match Bedrooms > 3\n"), "{}", answer.text);
    assert!(answer.text.contains("shape: (5,"));
    assert!(matches!(answer.intent, Some(QueryIntent::Filter { .. })));
}

#[tokio::test]
async fn test_pie_chart_wins_over_average() {
    let dir = tempfile::tempdir().unwrap();
    let session = homes_session(dir.path());

    let answer = session.ask("pie chart of the average price by region").await.unwrap();
    let chart = answer.chart.expect("pie chart");
    assert_eq!(chart.kind, ChartKind::Pie);
    assert_eq!(chart.x, "Region");
    assert_eq!(chart.y.as_deref(), Some("Price"));
    match chart.data {
        ChartData::Categories(points) => {
            assert_eq!(points[0].label, "West");
            assert_eq!(points[0].value, 475000.0);
        }
        ChartData::Points(_) => panic!("expected categories"),
    }
}

#[tokio::test]
async fn test_max_reports_row_details() {
    let dir = tempfile::tempdir().unwrap();
    let session = homes_session(dir.path());

    let answer = session.ask("what is the highest price?").await.unwrap();
    assert_eq!(
        answer.text,
        "maximum Price: 500000.00 (id: 5, Region: West, Property_Type: House, Bedrooms: 4)"
    );
}

#[tokio::test]
async fn test_silent_model_gives_fallback_answer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let (socket, _) = listener.accept().await.unwrap();
            held.push(socket);
        }
    });

    let dir = tempfile::tempdir().unwrap();
    let path = write_csv(dir.path(), "homes.csv", HOMES_CSV);

    let llm = LlmConfig::default()
        .with_url(format!("http://{}", addr))
        .with_timeout(Duration::from_millis(300));
    let backend: Arc<dyn ModelBackend> = Arc::new(OllamaBridge::new(llm).unwrap());
    let config = SessionConfig {
        routing: RoutingPolicy::ModelFirst,
        ..SessionConfig::default()
    };
    let mut model_first = Session::new(config, Arc::new(SynonymTable::default()), Some(backend));
    model_first.load_file(&path).unwrap();

    let question = "average price by region";
    let started = Instant::now();
    let answer = model_first.ask(question).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let offline = homes_session(dir.path());
    let direct = offline.ask(question).await.unwrap();
    assert_eq!(answer.text, direct.text);
    assert_eq!(answer.source, AnswerSource::Fallback);
    assert!(answer.text.starts_with("average Price by Region:\n- East: 285000.00"));
}

#[tokio::test]
async fn test_chart_on_absent_column_is_chart_error() {
    let dir = tempfile::tempdir().unwrap();
    let session = homes_session(dir.path());
    let dataset = session.dataset().unwrap();

    let request = VisualizeRequest::new(ChartKind::Bar).with_columns(["Garage"]);
    let err = VisualizationBuilder::default().build(dataset, &request).unwrap_err();
    assert!(matches!(err, InsightError::Chart(_)));

    // the session keeps answering afterwards
    let answer = session.ask("average price").await.unwrap();
    assert!(answer.text.starts_with("average Price: "));
}

#[tokio::test]
async fn test_malformed_upload_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = offline_session();

    let ragged = write_csv(dir.path(), "ragged.csv", "a,b\n1,2\n3\n");
    let err = session.load_file(&ragged).unwrap_err();
    assert!(matches!(err, InsightError::Upload(_)));

    let text = write_csv(dir.path(), "notes.txt", "a,b\n1,2\n");
    let err = session.load_file(&text).unwrap_err();
    assert!(matches!(err, InsightError::Upload(_)));

    let answer = session.ask("average price").await.unwrap();
    assert_eq!(answer.text, NO_DATASET_MESSAGE);
}

#[tokio::test]
async fn test_many_categories_fold_into_other() {
    let dir = tempfile::tempdir().unwrap();
    let mut content = String::from("city,sales\n");
    for i in 0..40 {
        content.push_str(&format!("city{:02},{}\n", i % 20, i));
    }
    let mut session = offline_session();
    session
        .load_file(write_csv(dir.path(), "cities.csv", &content))
        .unwrap();

    let answer = session.ask("bar chart of sales by city").await.unwrap();
    let chart = answer.chart.expect("bar chart");
    assert_eq!(chart.top_n, Some(15));
    match chart.data {
        ChartData::Categories(points) => {
            assert_eq!(points.len(), 16);
            assert_eq!(points[15].label, OTHER_LABEL);
        }
        ChartData::Points(_) => panic!("expected categories"),
    }
}

#[tokio::test]
async fn test_bare_number_after_comparison_keeps_its_column() {
    let dir = tempfile::tempdir().unwrap();
    let session = homes_session(dir.path());

    let answer = session
        .ask("show homes with price under 300000 and 3 bedrooms")
        .await
        .unwrap();
    assert!(answer.text.starts_with("3 rows match Price < 300000\n"), "{}", answer.text);
}

#[tokio::test]
async fn test_chart_x_axis_comes_from_by_clause() {
    let dir = tempfile::tempdir().unwrap();
    let session = homes_session(dir.path());

    let answer = session.ask("bar chart of price by bedrooms").await.unwrap();
    let chart = answer.chart.expect("bar chart");
    assert_eq!(chart.x, "Bedrooms");
    assert_eq!(chart.y.as_deref(), Some("Price"));
    match chart.data {
        ChartData::Categories(points) => {
            assert_eq!(points[0].label, "4");
            assert_eq!(points[0].value, 1210000.0);
        }
        ChartData::Points(_) => panic!("expected categories"),
    }
}

#[tokio::test]
async fn test_how_many_per_region_counts_rows() {
    let dir = tempfile::tempdir().unwrap();
    let session = homes_session(dir.path());

    let answer = session.ask("how many homes are in each region?").await.unwrap();
    assert_eq!(
        answer.text,
        "number of rows by Region:\n- East: 2\n- North: 2\n- South: 2\n- West: 2"
    );
    assert_eq!(answer.source, AnswerSource::Fallback);
}
