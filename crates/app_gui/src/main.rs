use eframe::{App, Frame, NativeOptions, egui};
use identify_core::{
    Classifier, ClassifierConfig, Effect, MobileNetOrt, Prediction, Session, UiEvent,
    format_prediction,
};
use rfd::FileDialog;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread;

fn main() {
    tracing_subscriber::fmt::init();
    let options = NativeOptions::default();
    if let Err(e) = eframe::run_native(
        "Photo Identify",
        options,
        Box::new(|_cc| {
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(Box::new(UiApp::default()))
        }),
    ) {
        eprintln!("Application stopped with error: {e}");
    }
}

/// Completion of a background workflow step.
enum WorkerMsg {
    ModelLoaded(anyhow::Result<Arc<dyn Classifier>>),
    ResultsReady(anyhow::Result<Vec<Prediction>>),
}

struct UiApp {
    session: Session,
    tx: Sender<WorkerMsg>,
    rx: Receiver<WorkerMsg>,
    // Texture for the currently uploaded photo, keyed by its path.
    photo_tex: Option<(PathBuf, egui::TextureHandle)>,
}

impl Default for UiApp {
    fn default() -> Self {
        let (tx, rx) = channel();
        Self {
            session: Session::new(),
            tx,
            rx,
            photo_tex: None,
        }
    }
}

/// Feed a worker completion into the session. Failures are logged and
/// the phase stays where it is: a failed load sticks at `LoadingModel`,
/// a failed classification at `Complete` with no results.
fn apply_worker_msg(session: &mut Session, msg: WorkerMsg) {
    match msg {
        WorkerMsg::ModelLoaded(Ok(model)) => session.finish_model_load(model),
        WorkerMsg::ModelLoaded(Err(e)) => tracing::error!("model load failed: {e:#}"),
        WorkerMsg::ResultsReady(Ok(results)) => session.finish_classification(results),
        WorkerMsg::ResultsReady(Err(e)) => tracing::error!("classification failed: {e:#}"),
    }
}

impl UiApp {
    fn run_effect(&mut self, effect: Effect, ctx: &egui::Context) {
        match effect {
            Effect::LoadModel => {
                let tx = self.tx.clone();
                let ctx = ctx.clone();
                thread::spawn(move || {
                    let cfg = ClassifierConfig::default();
                    let loaded = MobileNetOrt::load(&cfg)
                        .map(|m| Arc::new(m) as Arc<dyn Classifier>);
                    let _ = tx.send(WorkerMsg::ModelLoaded(loaded));
                    ctx.request_repaint();
                });
            }
            Effect::OpenFilePicker => {
                let picked = FileDialog::new()
                    .add_filter("Images", &["jpg", "jpeg", "png"])
                    .pick_file();
                // Cancelled dialog dispatches an empty selection, which
                // the session treats as a silent no-op.
                let files: Vec<PathBuf> = picked.into_iter().collect();
                if let Err(e) = self.session.dispatch(UiEvent::FilesSelected(files)) {
                    tracing::error!("upload failed: {e}");
                }
            }
            Effect::Classify { model, image } => {
                let tx = self.tx.clone();
                let ctx = ctx.clone();
                thread::spawn(move || {
                    let results = model.classify(&image);
                    let _ = tx.send(WorkerMsg::ResultsReady(results));
                    ctx.request_repaint();
                });
            }
        }
    }

    fn photo_texture(&mut self, ctx: &egui::Context) -> Option<egui::TextureId> {
        let path = self.session.image()?.to_path_buf();
        if let Some((cached, tex)) = &self.photo_tex
            && *cached == path
        {
            return Some(tex.id());
        }
        match image::open(&path) {
            Ok(img) => {
                let rgba = img.to_rgba8();
                let size = [rgba.width() as usize, rgba.height() as usize];
                let pixels = rgba.into_raw();
                let color = egui::ColorImage::from_rgba_unmultiplied(size, &pixels);
                let name = format!("photo:{}", path.display());
                let tex = ctx.load_texture(name, color, egui::TextureOptions::LINEAR);
                let id = tex.id();
                self.photo_tex = Some((path, tex));
                Some(id)
            }
            Err(e) => {
                tracing::warn!("Failed to load photo {}: {}", path.display(), e);
                None
            }
        }
    }
}

impl App for UiApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut Frame) {
        while let Ok(msg) = self.rx.try_recv() {
            apply_worker_msg(&mut self.session, msg);
        }

        egui::CentralPanel::default().show(ctx, |ui| {
            let flags = self.session.flags();

            if flags.show_image
                && let Some(id) = self.photo_texture(ctx)
            {
                let img = egui::load::SizedTexture::new(id, egui::Vec2::new(320.0, 320.0));
                ui.image(img);
                ui.add_space(6.0);
            }

            if flags.show_results {
                for prediction in self.session.results() {
                    ui.label(format_prediction(prediction));
                }
                ui.add_space(6.0);
            }

            let spec = self.session.action();
            if ui.button(spec.label).clicked() {
                match self.session.dispatch(UiEvent::ActionPressed) {
                    Ok(Some(effect)) => self.run_effect(effect, ctx),
                    Ok(None) => {}
                    Err(e) => tracing::error!("action failed: {e}"),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use identify_core::Phase;
    use std::path::Path;

    struct NoopClassifier;

    impl Classifier for NoopClassifier {
        fn classify(&self, _image: &Path) -> anyhow::Result<Vec<Prediction>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn successful_load_message_advances_the_session() {
        let mut session = Session::new();
        session.dispatch(UiEvent::ActionPressed).unwrap();
        assert_eq!(session.phase(), Phase::LoadingModel);

        apply_worker_msg(
            &mut session,
            WorkerMsg::ModelLoaded(Ok(Arc::new(NoopClassifier))),
        );
        assert_eq!(session.phase(), Phase::AwaitingUpload);
        assert!(session.has_model());
    }

    #[test]
    fn failed_load_message_leaves_the_session_stuck() {
        let mut session = Session::new();
        session.dispatch(UiEvent::ActionPressed).unwrap();

        apply_worker_msg(
            &mut session,
            WorkerMsg::ModelLoaded(Err(anyhow::anyhow!("no such model"))),
        );
        assert_eq!(session.phase(), Phase::LoadingModel);
        assert!(!session.has_model());
    }

    #[test]
    fn failed_classification_leaves_complete_with_no_results() {
        let mut session = Session::new();
        session.dispatch(UiEvent::ActionPressed).unwrap();
        apply_worker_msg(
            &mut session,
            WorkerMsg::ModelLoaded(Ok(Arc::new(NoopClassifier))),
        );
        session
            .dispatch(UiEvent::FilesSelected(vec![PathBuf::from("photo.png")]))
            .unwrap();
        session.dispatch(UiEvent::ActionPressed).unwrap();

        apply_worker_msg(
            &mut session,
            WorkerMsg::ResultsReady(Err(anyhow::anyhow!("inference error"))),
        );
        assert_eq!(session.phase(), Phase::Complete);
        assert!(session.results().is_empty());
    }
}
