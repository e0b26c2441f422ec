//! Image and video URL selection.

use std::collections::HashSet;

use crate::browser::{MediaCandidate, MediaKind, ObservedResponse};
use crate::constants::MEDIA_CDN_HOSTS;
use crate::platform;

fn on_media_cdn(url: &str) -> bool {
    platform::host_of(url).is_some_and(|host| {
        MEDIA_CDN_HOSTS
            .iter()
            .any(|cdn| host == *cdn || host.ends_with(&format!(".{cdn}")))
    })
}

fn push_unique(out: &mut Vec<String>, seen: &mut HashSet<String>, url: &str) {
    if seen.insert(url.to_string()) {
        out.push(url.to_string());
    }
}

/// Post images: CDN-hosted and large enough on both sides to not be an avatar.
#[must_use]
pub fn select_images(candidates: &[MediaCandidate], min_px: u32) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for candidate in candidates {
        if candidate.kind == MediaKind::Image
            && candidate.width >= min_px
            && candidate.height >= min_px
            && on_media_cdn(&candidate.src)
        {
            push_unique(&mut out, &mut seen, &candidate.src);
        }
    }
    out
}

/// Playable video sources from the DOM and the network, minus poster frames.
#[must_use]
pub fn select_videos(candidates: &[MediaCandidate], intercepted: &[String]) -> Vec<String> {
    let posters: HashSet<&str> = candidates
        .iter()
        .filter(|c| c.kind == MediaKind::Poster)
        .map(|c| c.src.as_str())
        .collect();

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let sources = candidates
        .iter()
        .filter(|c| c.kind == MediaKind::Video)
        .map(|c| c.src.as_str())
        .chain(intercepted.iter().map(String::as_str));
    for src in sources {
        // blob: URLs only exist inside the page that created them
        if src.starts_with("blob:") || posters.contains(src) {
            continue;
        }
        push_unique(&mut out, &mut seen, src);
    }
    out
}

/// Whether a network response is a CDN video, judged by MIME type or extension.
#[must_use]
pub fn is_video_response(response: &ObservedResponse) -> bool {
    if !on_media_cdn(&response.url) {
        return false;
    }
    if response.mime_type.starts_with("video/") {
        return true;
    }
    let path = url::Url::parse(&response.url)
        .map(|u| u.path().to_string())
        .unwrap_or_default();
    mime_guess::from_path(&path)
        .first()
        .is_some_and(|mime| mime.type_().as_str() == "video")
}
