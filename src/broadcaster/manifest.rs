//! Live manifest (WebRTC DASH profile) generation

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;

use crate::error::{AppError, Result};

const MPD_PROFILE: &str = "urn:mpeg:dash:profile:webrtc-live:2022";
const MPD_NAMESPACE: &str = "urn:mpeg:dash:schema:mpd:2011";
const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";
const XLINK_NAMESPACE: &str = "http://www.w3.org/1999/xlink";
const SCHEMA_LOCATION: &str = "urn:mpeg:DASH:schema:MPD:2011 DASH-MPD.xsd";

/// Build the manifest for a channel
///
/// When `preroll` is set, a period that loads it eagerly
/// (`xlink:actuate="onLoad"`) precedes the live period. The live period's
/// adaptation set points at `link` with relation `rel` and is resolved on
/// request.
pub fn generate(link: &str, rel: &str, preroll: Option<&str>) -> Result<String> {
    write_manifest(link, rel, preroll).map_err(|e| AppError::Internal(format!("Failed to build manifest: {}", e)))
}

fn write_manifest(link: &str, rel: &str, preroll: Option<&str>) -> quick_xml::Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut mpd = BytesStart::new("MPD");
    mpd.push_attribute(("profiles", MPD_PROFILE));
    mpd.push_attribute(("type", "static"));
    mpd.push_attribute(("xmlns", MPD_NAMESPACE));
    mpd.push_attribute(("xmlns:xsi", XSI_NAMESPACE));
    mpd.push_attribute(("xmlns:xlink", XLINK_NAMESPACE));
    mpd.push_attribute(("xsi:schemaLocation", SCHEMA_LOCATION));
    writer.write_event(Event::Start(mpd))?;

    if let Some(href) = preroll {
        let mut period = BytesStart::new("Period");
        period.push_attribute(("xlink:href", href));
        period.push_attribute(("xlink:actuate", "onLoad"));
        writer.write_event(Event::Empty(period))?;
    }

    writer.write_event(Event::Start(BytesStart::new("Period")))?;
    let mut adaptation_set = BytesStart::new("AdaptationSet");
    adaptation_set.push_attribute(("xlink:href", link));
    adaptation_set.push_attribute(("xlink:rel", rel));
    adaptation_set.push_attribute(("xlink:actuate", "onRequest"));
    writer.write_event(Event::Empty(adaptation_set))?;
    writer.write_event(Event::End(BytesEnd::new("Period")))?;

    writer.write_event(Event::End(BytesEnd::new("MPD")))?;

    Ok(String::from_utf8_lossy(&writer.into_inner()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINK: &str = "http://localhost:8001/broadcaster/channel/ch1";
    const REL: &str = "urn:ietf:params:whip:whpp";

    #[test]
    fn test_live_only() {
        let xml = generate(LINK, REL, None).unwrap();

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("profiles=\"urn:mpeg:dash:profile:webrtc-live:2022\""));
        assert!(xml.contains("type=\"static\""));
        assert!(xml.contains("xmlns=\"urn:mpeg:dash:schema:mpd:2011\""));
        assert!(xml.contains("xmlns:xlink=\"http://www.w3.org/1999/xlink\""));
        assert_eq!(xml.matches("<Period").count(), 1);
        assert!(xml.contains(&format!("xlink:href=\"{}\"", LINK)));
        assert!(xml.contains(&format!("xlink:rel=\"{}\"", REL)));
        assert!(xml.contains("xlink:actuate=\"onRequest\""));
        assert!(!xml.contains("onLoad"));
    }

    #[test]
    fn test_preroll_precedes_live_period() {
        let xml = generate(LINK, REL, Some("https://ads.example.com/preroll.mpd")).unwrap();

        assert_eq!(xml.matches("<Period").count(), 2);
        let preroll = xml.find("onLoad").unwrap();
        let live = xml.find("onRequest").unwrap();
        assert!(preroll < live);
        assert!(xml.contains("xlink:href=\"https://ads.example.com/preroll.mpd\""));
    }

    #[test]
    fn test_attribute_values_are_escaped() {
        let xml = generate("http://h/channel/a&b", REL, None).unwrap();
        assert!(xml.contains("a&amp;b"));
    }
}
