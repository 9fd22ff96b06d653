use crate::{dto::now_millis, errors::BridgeError, model::DEFAULT_MODEL};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub frame_rate: u32,
    pub detection_threshold: f64,
    pub model: String,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            frame_rate: 5,
            detection_threshold: 0.5,
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

impl CameraSettings {
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.frame_rate == 0 {
            return Err(BridgeError::InvalidArgument(
                "frame_rate must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.detection_threshold) {
            return Err(BridgeError::InvalidArgument(
                "detection_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

/// A configured camera session. Counters are updated from the frame path
/// without taking the settings lock.
#[derive(Debug)]
pub struct CameraSession {
    session_id: String,
    start_time: u64,
    settings: Mutex<CameraSettings>,
    total_frames: AtomicU64,
    detected_frames: AtomicU64,
    detected_objects: AtomicU64,
    last_activity: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSessionInfo {
    pub session_id: String,
    #[serde(flatten)]
    pub settings: CameraSettings,
    pub total_frames: u64,
    pub detected_frames: u64,
    pub detected_objects: u64,
    pub avg_fps: f64,
    pub start_time: u64,
    pub last_activity: u64,
}

impl CameraSession {
    fn new(session_id: String, settings: CameraSettings) -> Self {
        let now = now_millis();
        Self {
            session_id,
            start_time: now,
            settings: Mutex::new(settings),
            total_frames: AtomicU64::new(0),
            detected_frames: AtomicU64::new(0),
            detected_objects: AtomicU64::new(0),
            last_activity: AtomicU64::new(now),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn record_frame(&self, detections: usize) {
        self.total_frames.fetch_add(1, Ordering::Relaxed);
        if detections > 0 {
            self.detected_frames.fetch_add(1, Ordering::Relaxed);
            self.detected_objects
                .fetch_add(detections as u64, Ordering::Relaxed);
        }
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    async fn info(&self) -> CameraSessionInfo {
        let total_frames = self.total_frames.load(Ordering::Relaxed);
        let last_activity = self.last_activity.load(Ordering::Relaxed);
        let elapsed_ms = now_millis().saturating_sub(self.start_time);
        let avg_fps = if elapsed_ms > 0 {
            total_frames as f64 * 1000.0 / elapsed_ms as f64
        } else {
            0.0
        };

        CameraSessionInfo {
            session_id: self.session_id.clone(),
            settings: self.settings.lock().await.clone(),
            total_frames,
            detected_frames: self.detected_frames.load(Ordering::Relaxed),
            detected_objects: self.detected_objects.load(Ordering::Relaxed),
            avg_fps,
            start_time: self.start_time,
            last_activity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraStatus {
    pub success: bool,
    pub message: String,
    pub active_sessions: BTreeMap<String, CameraSessionInfo>,
    pub total_sessions: usize,
    pub total_frames: u64,
    pub detected_frames: u64,
    pub detected_objects: u64,
    pub timestamp: u64,
}

/// Camera sessions configured by clients, plus totals over every camera
/// frame. Frames for unknown session ids only count towards the totals.
#[derive(Debug, Default)]
pub struct CameraRegistry {
    sessions: RwLock<HashMap<String, Arc<CameraSession>>>,
    total_frames: AtomicU64,
    detected_frames: AtomicU64,
    detected_objects: AtomicU64,
}

impl CameraRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the session or replaces the settings of an existing one, and
    /// returns its id.
    pub async fn configure(
        &self,
        session_id: Option<String>,
        settings: CameraSettings,
    ) -> Result<String, BridgeError> {
        settings.validate()?;
        let session_id = session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("camera_session_{}", now_millis()));

        let mut sessions = self.sessions.write().await;
        match sessions.get(&session_id) {
            Some(session) => *session.settings.lock().await = settings,
            None => {
                sessions.insert(
                    session_id.clone(),
                    Arc::new(CameraSession::new(session_id.clone(), settings)),
                );
            }
        }
        tracing::info!("Camera session {} configured", session_id);
        Ok(session_id)
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<CameraSession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn stop(&self, session_id: &str) -> Result<(), BridgeError> {
        match self.sessions.write().await.remove(session_id) {
            Some(_) => {
                tracing::info!("Camera session {} stopped", session_id);
                Ok(())
            }
            None => Err(BridgeError::InvalidArgument(format!(
                "Session not found: {}",
                session_id
            ))),
        }
    }

    pub fn record_frame(&self, session: Option<&CameraSession>, detections: usize) {
        if let Some(session) = session {
            session.record_frame(detections);
        }
        self.total_frames.fetch_add(1, Ordering::Relaxed);
        if detections > 0 {
            self.detected_frames.fetch_add(1, Ordering::Relaxed);
            self.detected_objects
                .fetch_add(detections as u64, Ordering::Relaxed);
        }
    }

    pub async fn status(&self) -> CameraStatus {
        let sessions: Vec<Arc<CameraSession>> =
            self.sessions.read().await.values().cloned().collect();
        let mut active_sessions = BTreeMap::new();
        for session in sessions {
            active_sessions.insert(session.session_id.clone(), session.info().await);
        }

        CameraStatus {
            success: true,
            message: "Camera status retrieved successfully".to_string(),
            total_sessions: active_sessions.len(),
            active_sessions,
            total_frames: self.total_frames.load(Ordering::Relaxed),
            detected_frames: self.detected_frames.load(Ordering::Relaxed),
            detected_objects: self.detected_objects.load(Ordering::Relaxed),
            timestamp: now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_configure_records_and_stops() {
        let registry = CameraRegistry::new();
        let id = registry
            .configure(Some("cam-1".to_string()), CameraSettings::default())
            .await
            .unwrap();
        let session = registry.get(&id).await.unwrap();

        registry.record_frame(Some(&session), 2);
        registry.record_frame(Some(&session), 0);
        registry.record_frame(None, 3);

        let status = registry.status().await;
        let info = &status.active_sessions["cam-1"];
        assert_eq!(status.total_sessions, 1);
        assert_eq!(info.total_frames, 2);
        assert_eq!(info.detected_frames, 1);
        assert_eq!(info.detected_objects, 2);
        assert_eq!(status.total_frames, 3);
        assert_eq!(status.detected_objects, 5);

        registry.stop("cam-1").await.unwrap();
        assert!(registry.get("cam-1").await.is_none());
        assert!(matches!(
            registry.stop("cam-1").await,
            Err(BridgeError::InvalidArgument(ref m)) if m == "Session not found: cam-1"
        ));
    }

    #[tokio::test]
    async fn test_reconfigure_keeps_counters() {
        let registry = CameraRegistry::new();
        let id = registry.configure(None, CameraSettings::default()).await.unwrap();
        assert!(id.starts_with("camera_session_"));
        let session = registry.get(&id).await.unwrap();
        registry.record_frame(Some(&session), 1);

        let settings = CameraSettings {
            frame_rate: 10,
            ..CameraSettings::default()
        };
        registry.configure(Some(id.clone()), settings).await.unwrap();

        let info = &registry.status().await.active_sessions[&id];
        assert_eq!(info.settings.frame_rate, 10);
        assert_eq!(info.total_frames, 1);
    }

    #[tokio::test]
    async fn test_invalid_settings_are_rejected() {
        let registry = CameraRegistry::new();
        let settings = CameraSettings {
            detection_threshold: 1.5,
            ..CameraSettings::default()
        };

        assert!(matches!(
            registry.configure(None, settings).await,
            Err(BridgeError::InvalidArgument(_))
        ));
        assert_eq!(registry.status().await.total_sessions, 0);
    }
}
