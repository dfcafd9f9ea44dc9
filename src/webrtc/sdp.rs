//! SDP helpers
//!
//! Full descriptions are parsed with the `sdp` crate re-exported by webrtc-rs.
//! Trickle-ICE fragments carry no session header, so they are scanned line by
//! line and each candidate is checked with the ICE candidate parser.

use std::io::Cursor;
use webrtc::ice::candidate::candidate_base::unmarshal_candidate;
use webrtc::sdp::description::session::SessionDescription;

use super::signaling::IceCandidate;
use crate::error::{AppError, Result};

/// Parse a complete session description
pub fn parse_session(sdp: &str) -> Result<SessionDescription> {
    let mut reader = Cursor::new(sdp.as_bytes());
    SessionDescription::unmarshal(&mut reader)
        .map_err(|e| AppError::Negotiation(format!("Invalid SDP: {}", e)))
}

/// Distinct media stream ids announced through `a=msid`, in m-line order
///
/// Each m-section contributes its first `a=msid:<stream> <track>` attribute
/// when it has exactly two space-separated parts; later duplicates of a
/// stream id are ignored.
pub fn media_stream_ids(sdp: &str) -> Result<Vec<String>> {
    let session = parse_session(sdp)?;
    let mut ids: Vec<String> = Vec::new();

    for media in &session.media_descriptions {
        let Some(Some(value)) = media.attribute("msid") else {
            continue;
        };
        let parts: Vec<&str> = value.split(' ').collect();
        if parts.len() != 2 {
            continue;
        }
        if !ids.iter().any(|id| id == parts[0]) {
            ids.push(parts[0].to_string());
        }
    }

    Ok(ids)
}

/// Reject a candidate line the ICE agent could not parse
pub fn validate_candidate(candidate: &str) -> Result<()> {
    let raw = candidate.strip_prefix("candidate:").unwrap_or(candidate);
    unmarshal_candidate(raw)
        .map(|_| ())
        .map_err(|e| AppError::BadRequest(format!("Invalid ICE candidate '{}': {}", candidate, e)))
}

/// Extract candidates from an `application/trickle-ice-sdpfrag` body
///
/// Every `a=candidate` line becomes one candidate, tagged with the mid and
/// m-line index of the section it appears in and the effective ICE ufrag.
pub fn parse_trickle_fragment(fragment: &str) -> Vec<IceCandidate> {
    let mut candidates = Vec::new();
    let mut session_ufrag: Option<String> = None;
    let mut media_ufrag: Option<String> = None;
    let mut mid: Option<String> = None;
    let mut mline_index: Option<u16> = None;

    for line in fragment.lines().map(str::trim) {
        if line.starts_with("m=") {
            mline_index = Some(mline_index.map_or(0, |i| i + 1));
            mid = None;
            media_ufrag = None;
        } else if let Some(value) = line.strip_prefix("a=ice-ufrag:") {
            if mline_index.is_some() {
                media_ufrag = Some(value.to_string());
            } else {
                session_ufrag = Some(value.to_string());
            }
        } else if let Some(value) = line.strip_prefix("a=mid:") {
            mid = Some(value.to_string());
        } else if let Some(value) = line.strip_prefix("a=") {
            if !value.starts_with("candidate:") {
                continue;
            }
            candidates.push(IceCandidate {
                candidate: value.to_string(),
                sdp_mid: mid.clone(),
                sdp_mline_index: mline_index,
                username_fragment: media_ufrag.clone().or_else(|| session_ufrag.clone()),
            });
        }
    }

    candidates
}
