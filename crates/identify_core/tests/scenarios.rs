use anyhow::Result;
use identify_core::{
    Classifier, Effect, Phase, Prediction, Session, UiEvent, format_prediction,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Stub classifier returning a fixed ranking.
struct FixedClassifier(Vec<Prediction>);

impl Classifier for FixedClassifier {
    fn classify(&self, _image: &Path) -> Result<Vec<Prediction>> {
        Ok(self.0.clone())
    }
}

fn cat_dog() -> Vec<Prediction> {
    vec![
        Prediction {
            label: "cat".to_string(),
            probability: 0.87,
        },
        Prediction {
            label: "dog".to_string(),
            probability: 0.10,
        },
    ]
}

/// Drive a fresh session through the load workflow.
fn loaded_session() -> Session {
    let mut session = Session::new();
    let effect = session.dispatch(UiEvent::ActionPressed).unwrap();
    assert!(matches!(effect, Some(Effect::LoadModel)));
    assert_eq!(session.phase(), Phase::LoadingModel);
    session.finish_model_load(Arc::new(FixedClassifier(cat_dog())));
    session
}

#[test]
fn scenario_load_model_settles_at_awaiting_upload() {
    let session = loaded_session();
    assert_eq!(session.phase(), Phase::AwaitingUpload);
    assert!(session.has_model());
}

#[test]
fn scenario_upload_stores_first_file_and_shows_image() {
    let mut session = loaded_session();
    session
        .dispatch(UiEvent::FilesSelected(vec![PathBuf::from("photo.png")]))
        .unwrap();
    assert_eq!(session.phase(), Phase::Ready);
    assert_eq!(session.image(), Some(Path::new("photo.png")));
    assert!(session.flags().show_image);
    assert!(!session.flags().show_results);
}

#[test]
fn scenario_classify_completes_before_results_arrive() {
    let mut session = loaded_session();
    session
        .dispatch(UiEvent::FilesSelected(vec![PathBuf::from("photo.png")]))
        .unwrap();

    let effect = session.dispatch(UiEvent::ActionPressed).unwrap();
    // Phase already reads Complete while the classify call is in flight
    // and the results are still empty.
    assert_eq!(session.phase(), Phase::Complete);
    assert!(session.results().is_empty());

    let Some(Effect::Classify { model, image }) = effect else {
        panic!("expected a classify effect");
    };
    let results = model.classify(&image).unwrap();
    session.finish_classification(results);

    assert_eq!(session.results(), cat_dog().as_slice());
    assert_eq!(format_prediction(&session.results()[0]), "cat: 87.00%");
    assert!(session.flags().show_results);
}

#[test]
fn scenario_try_another_keeps_stale_results() {
    let mut session = loaded_session();
    session
        .dispatch(UiEvent::FilesSelected(vec![PathBuf::from("photo.png")]))
        .unwrap();
    let effect = session.dispatch(UiEvent::ActionPressed).unwrap();
    let Some(Effect::Classify { model, image }) = effect else {
        panic!("expected a classify effect");
    };
    session.finish_classification(model.classify(&image).unwrap());

    let effect = session.dispatch(UiEvent::ActionPressed).unwrap();
    assert!(effect.is_none());
    assert_eq!(session.phase(), Phase::AwaitingUpload);
    // Not cleared; overwritten only by the next upload/classify cycle.
    assert_eq!(session.results(), cat_dog().as_slice());
    assert!(session.image().is_some());
}

#[test]
fn button_is_inert_while_work_is_in_flight() {
    let mut session = Session::new();
    session.dispatch(UiEvent::ActionPressed).unwrap();
    assert_eq!(session.phase(), Phase::LoadingModel);

    // Pressing again while the load is pending does nothing.
    let effect = session.dispatch(UiEvent::ActionPressed).unwrap();
    assert!(effect.is_none());
    assert_eq!(session.phase(), Phase::LoadingModel);
}
