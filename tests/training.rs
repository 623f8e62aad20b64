use burn::{
    backend::{Autodiff, NdArray},
    data::dataset::{vision::MnistItem, InMemDataset},
    optim::AdamConfig,
};
use mnist_training::{
    data::MnistProvider,
    model::{ModelConfig, PassMode},
    tracking::{FileSink, InMemorySink, MetricSink, RunStatus, SinkEvent, TrackingError},
    training::{run, TrainingConfig, FINAL_TEST_ACCURACY, MODEL_ARTIFACT},
    TrainingError,
};

type TestBackend = Autodiff<NdArray<f32>>;

const METRIC_KEYS: [&str; 4] = ["test_accuracy", "test_loss", "train_accuracy", "train_loss"];

fn digit(label: u8) -> MnistItem {
    let mut image = [[0.0; 28]; 28];
    for row in image.iter_mut().skip(label as usize * 2).take(2) {
        *row = [255.0; 28];
    }
    MnistItem { image, label }
}

fn digits(count: usize) -> InMemDataset<MnistItem> {
    InMemDataset::new((0..count).map(|i| digit((i % 10) as u8)).collect())
}

fn config(num_epochs: usize) -> TrainingConfig {
    TrainingConfig::new(ModelConfig::new(), AdamConfig::new())
        .with_num_epochs(num_epochs)
        .with_batch_size(64)
        .with_experiment_name("mnist-test".to_string())
}

fn train<S: MetricSink + ?Sized>(
    config: &TrainingConfig,
    provider: &MnistProvider,
    sink: &mut S,
) -> Result<mnist_training::training::TrainingSummary, TrainingError> {
    run::<TestBackend, _>(config, provider, Default::default(), sink)
}

#[test]
fn single_epoch_run_is_tracked() {
    let provider = MnistProvider::new(digits(128), digits(50));
    let mut sink = InMemorySink::new();

    let summary = train(&config(1), &provider, &mut sink).unwrap();

    let snapshots = sink.snapshots();
    assert_eq!(snapshots.len(), 1);
    let (step, metrics) = snapshots[0];
    assert_eq!(step, 1);
    assert_eq!(metrics.keys().map(String::as_str).collect::<Vec<_>>(), METRIC_KEYS);
    for key in ["train_accuracy", "test_accuracy"] {
        assert!((0.0..=1.0).contains(&metrics[key]));
    }
    for key in ["train_loss", "test_loss"] {
        assert!(metrics[key] >= 0.0);
    }

    assert_eq!(
        sink.scalars(),
        vec![(FINAL_TEST_ACCURACY, metrics["test_accuracy"])]
    );
    assert_eq!(summary.final_test_accuracy, metrics["test_accuracy"]);
    assert_eq!(summary.history.len(), 1);
    assert_eq!(summary.history[0].train.num_samples, 128);
    assert_eq!(summary.history[0].test.num_samples, 50);
    assert_eq!(summary.run_id, "run-1");

    assert_eq!(sink.closed(), vec![RunStatus::Finished]);
    assert!(sink.events().iter().any(|event| matches!(
        event,
        SinkEvent::Artifact { name, size } if name == MODEL_ARTIFACT && *size > 0
    )));
}

#[test]
fn events_follow_the_run_lifecycle() {
    let provider = MnistProvider::new(digits(64), digits(20));
    let mut sink = InMemorySink::new();

    train(&config(2), &provider, &mut sink).unwrap();

    let events = sink.events();
    assert!(matches!(
        &events[0],
        SinkEvent::BeginRun { experiment_name, .. } if experiment_name == "mnist-test"
    ));
    assert!(matches!(&events[1], SinkEvent::Params(_)));
    assert!(matches!(&events[2], SinkEvent::Metrics { step: 1, .. }));
    assert!(matches!(&events[3], SinkEvent::Metrics { step: 2, .. }));
    assert!(matches!(&events[4], SinkEvent::Artifact { .. }));
    assert!(matches!(&events[5], SinkEvent::Metric { .. }));
    assert!(matches!(
        &events[6],
        SinkEvent::EndRun {
            status: RunStatus::Finished,
            ..
        }
    ));
    assert_eq!(events.len(), 7);

    let params = sink.params();
    assert_eq!(params["epochs"], "2");
    assert_eq!(params["batch_size"], "64");
    assert_eq!(params["optimizer"], "Adam");
    assert!(params.contains_key("device"));
}

#[test]
fn empty_eval_split_fails_the_run_once() {
    let provider = MnistProvider::new(digits(128), InMemDataset::<MnistItem>::new(vec![]));
    let mut sink = InMemorySink::new();

    let err = train(&config(3), &provider, &mut sink).unwrap_err();

    assert!(matches!(
        err,
        TrainingError::EmptyDataset {
            mode: PassMode::Eval
        }
    ));
    assert_eq!(sink.closed(), vec![RunStatus::Failed]);
    assert!(sink.snapshots().is_empty());
    assert!(sink.scalars().is_empty());
    assert!(!sink
        .events()
        .iter()
        .any(|event| matches!(event, SinkEvent::Artifact { .. })));
}

#[test]
fn sink_failure_still_closes_the_run() {
    let provider = MnistProvider::new(digits(64), digits(20));
    let mut sink = InMemorySink::new().failing_metrics_at(2);

    let err = train(&config(3), &provider, &mut sink).unwrap_err();

    assert!(matches!(
        err,
        TrainingError::Tracking(TrackingError::Api { status: 503, .. })
    ));
    assert_eq!(sink.snapshots().len(), 1);
    assert_eq!(sink.closed(), vec![RunStatus::Failed]);
}

#[test]
fn file_sink_stores_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MnistProvider::new(digits(64), digits(20));
    let mut sink = FileSink::new(dir.path());

    let summary = train(&config(2), &provider, &mut sink).unwrap();

    let run_dir = dir.path().join("mnist-test").join(&summary.run_id);
    assert!(run_dir.join("params.json").is_file());
    assert!(run_dir.join("artifacts/model/model.bin").is_file());
    assert!(run_dir.join("artifacts/model/config.json").is_file());

    let status: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(run_dir.join("status.json")).unwrap())
            .unwrap();
    assert_eq!(status["status"], "FINISHED");

    let lines = std::fs::read_to_string(run_dir.join("metrics.jsonl")).unwrap();
    let metrics: Vec<serde_json::Value> = lines
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    // Four metrics per epoch, then the final accuracy.
    assert_eq!(metrics.len(), 9);
    assert_eq!(metrics[8]["name"], FINAL_TEST_ACCURACY);
    let logged = metrics[8]["value"].as_f64().unwrap();
    assert!((logged - summary.final_test_accuracy).abs() < 1e-12);
}
