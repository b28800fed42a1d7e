use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Opaque tab identifier, allocated by the registry and never reused.
    TabId
);
id_type!(SpaceId);
id_type!(WindowId);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum LoadingState {
    Idle,
    ProvisionalNavigationStarted,
    ContentCommitted,
    Finished,
    Failed(String),
    ProvisionalFailed(String),
}

impl LoadingState {
    pub fn is_loading(&self) -> bool {
        matches!(
            self,
            LoadingState::ProvisionalNavigationStarted | LoadingState::ContentCommitted
        )
    }
}

/// Where a tab lives: in exactly one space, or pinned as an essential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "space", rename_all = "snake_case")]
pub enum TabMembership {
    Space(SpaceId),
    Essential,
}

/// Reports from the web engine about one tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NavigationEvent {
    ProvisionalStarted { url: String },
    Committed { url: String },
    Finished,
    Failed { error: String },
    ProvisionalFailed { error: String },
    TitleChanged { title: String },
    FaviconChanged { url: Option<String> },
    MediaChanged { audio: bool, video: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tab {
    pub id: TabId,
    pub url: String,
    pub title: String,
    pub favicon_url: Option<String>,
    pub loading: LoadingState,
    pub is_playing_audio: bool,
    pub has_video: bool,
    pub membership: TabMembership,
    /// URL of a provisional navigation that has not committed yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_url: Option<String>,
}

impl Tab {
    pub fn new(id: TabId, url: impl Into<String>, membership: TabMembership) -> Self {
        Self {
            id,
            url: url.into(),
            title: String::new(),
            favicon_url: None,
            loading: LoadingState::Idle,
            is_playing_audio: false,
            has_video: false,
            membership,
            pending_url: None,
        }
    }

    /// Title for display, falling back to the URL.
    pub fn display_title(&self) -> &str {
        if self.title.trim().is_empty() {
            &self.url
        } else {
            &self.title
        }
    }

    /// Start loading `url`. The engine reports progress through [`Tab::apply`].
    pub fn navigate(&mut self, url: impl Into<String>) {
        self.url = url.into();
        self.pending_url = None;
        self.loading = LoadingState::Idle;
    }

    pub fn apply(&mut self, event: NavigationEvent) {
        match event {
            NavigationEvent::ProvisionalStarted { url } => {
                self.pending_url = Some(url);
                self.loading = LoadingState::ProvisionalNavigationStarted;
            }
            NavigationEvent::Committed { url } => {
                self.url = url;
                self.pending_url = None;
                self.loading = LoadingState::ContentCommitted;
            }
            NavigationEvent::Finished => {
                self.pending_url = None;
                self.loading = LoadingState::Finished;
            }
            NavigationEvent::Failed { error } => {
                self.pending_url = None;
                self.loading = LoadingState::Failed(error);
            }
            // The last committed URL stays put.
            NavigationEvent::ProvisionalFailed { error } => {
                self.pending_url = None;
                self.loading = LoadingState::ProvisionalFailed(error);
            }
            NavigationEvent::TitleChanged { title } => self.title = title,
            NavigationEvent::FaviconChanged { url } => self.favicon_url = url,
            NavigationEvent::MediaChanged { audio, video } => {
                self.is_playing_audio = audio;
                self.has_video = video;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub id: SpaceId,
    pub name: String,
    pub tabs: Vec<TabId>,
}

impl Space {
    pub fn new(id: SpaceId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            tabs: Vec::new(),
        }
    }

    pub fn position(&self, tab: TabId) -> Option<usize> {
        self.tabs.iter().position(|t| *t == tab)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tab() -> Tab {
        Tab::new(TabId(1), "https://old.example", TabMembership::Space(SpaceId(1)))
    }

    #[test]
    fn provisional_failure_keeps_committed_url() {
        let mut tab = tab();
        tab.apply(NavigationEvent::ProvisionalStarted {
            url: "https://new.example".into(),
        });
        assert!(tab.loading.is_loading());
        assert_eq!(tab.pending_url.as_deref(), Some("https://new.example"));

        tab.apply(NavigationEvent::ProvisionalFailed {
            error: "DNS lookup failed".into(),
        });
        assert_eq!(tab.url, "https://old.example");
        assert_eq!(tab.pending_url, None);
        assert_eq!(
            tab.loading,
            LoadingState::ProvisionalFailed("DNS lookup failed".into())
        );
    }

    #[test]
    fn commit_then_finish_updates_url() {
        let mut tab = tab();
        tab.apply(NavigationEvent::ProvisionalStarted {
            url: "https://new.example".into(),
        });
        tab.apply(NavigationEvent::Committed {
            url: "https://new.example/landing".into(),
        });
        tab.apply(NavigationEvent::Finished);
        assert_eq!(tab.url, "https://new.example/landing");
        assert_eq!(tab.loading, LoadingState::Finished);
        assert!(!tab.loading.is_loading());
    }

    #[test]
    fn display_title_falls_back_to_url() {
        let mut tab = tab();
        assert_eq!(tab.display_title(), "https://old.example");
        tab.apply(NavigationEvent::TitleChanged { title: "Old".into() });
        assert_eq!(tab.display_title(), "Old");
    }

    #[test]
    fn media_and_favicon_events() {
        let mut tab = tab();
        tab.apply(NavigationEvent::MediaChanged {
            audio: true,
            video: false,
        });
        tab.apply(NavigationEvent::FaviconChanged {
            url: Some("https://old.example/favicon.ico".into()),
        });
        assert!(tab.is_playing_audio);
        assert!(!tab.has_video);
        assert!(tab.favicon_url.is_some());
    }

    #[test]
    fn ids_serialize_as_numbers() {
        assert_eq!(serde_json::to_string(&TabId(42)).unwrap(), "42");
        let membership: TabMembership =
            serde_json::from_str(r#"{"kind":"space","space":3}"#).unwrap();
        assert_eq!(membership, TabMembership::Space(SpaceId(3)));
    }
}
