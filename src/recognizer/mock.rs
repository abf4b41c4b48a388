// Scripted recognizer transport for tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{Recognition, RecognizerError, RecognizerTransport};

/// One scripted call outcome.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Ok(Recognition),
    RateLimited,
    Transport(String),
    Permanent { status: u16, message: String },
}

impl ScriptedOutcome {
    pub fn ok(text: &str, language: Option<&str>) -> Self {
        ScriptedOutcome::Ok(Recognition {
            text: text.to_string(),
            language: language.map(String::from),
            sub_segments: Vec::new(),
        })
    }
}

/// Transport that plays back a queue of outcomes, then falls through to a
/// deterministic synthesizer: the returned text embeds the audio content so
/// two runs over the same blob transcribe identically.
#[derive(Clone)]
pub struct ScriptedTransport {
    script: Arc<Mutex<VecDeque<ScriptedOutcome>>>,
    calls: Arc<AtomicUsize>,
    languages_seen: Arc<Mutex<Vec<Option<String>>>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(AtomicUsize::new(0)),
            languages_seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, outcome: ScriptedOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Language arguments observed per call, in order.
    pub fn languages_seen(&self) -> Vec<Option<String>> {
        self.languages_seen.lock().unwrap().clone()
    }

    fn synthesize(audio: &[u8], language: Option<&str>) -> Recognition {
        let first_line = audio
            .split(|b| *b == b'\n')
            .next()
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .unwrap_or_default();
        Recognition {
            text: format!("spoken: {first_line}"),
            language: Some(language.unwrap_or("en").to_string()),
            sub_segments: Vec::new(),
        }
    }
}

#[async_trait::async_trait]
impl RecognizerTransport for ScriptedTransport {
    async fn recognize(
        &self,
        audio_path: &Path,
        language: Option<&str>,
    ) -> Result<Recognition, RecognizerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.languages_seen
            .lock()
            .unwrap()
            .push(language.map(String::from));

        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(ScriptedOutcome::Ok(recognition)) => Ok(recognition),
            Some(ScriptedOutcome::RateLimited) => Err(RecognizerError::RateLimited),
            Some(ScriptedOutcome::Transport(message)) => {
                Err(RecognizerError::Transport(message))
            }
            Some(ScriptedOutcome::Permanent { status, message }) => {
                Err(RecognizerError::Permanent { status, message })
            }
            None => {
                let audio = tokio::fs::read(audio_path).await?;
                Ok(Self::synthesize(&audio, language))
            }
        }
    }
}
