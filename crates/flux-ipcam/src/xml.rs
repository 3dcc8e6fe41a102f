//! 厂商 XML 回复的轻量解析
//!
//! 只关心元素的本地名（忽略命名空间前缀），遇到格式错误时返回 `None`。

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

/// 根元素本地名
pub fn root_element(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// 第一个匹配元素的文本
pub fn element_text(xml: &str, name: &str) -> Option<String> {
    element_texts(xml, name).into_iter().next()
}

/// 所有匹配元素的文本（按出现顺序）
pub fn element_texts(xml: &str, name: &str) -> Vec<String> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut values = Vec::new();
    let mut inside = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                inside = e.local_name().as_ref() == name.as_bytes();
            }
            Ok(Event::Text(t)) if inside => {
                if let Ok(text) = t.unescape() {
                    values.push(text.into_owned());
                }
                inside = false;
            }
            Ok(Event::End(_)) => inside = false,
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
    values
}

/// 所有匹配元素上某个属性的值
pub fn attribute_values(xml: &str, element: &str, attribute: &str) -> Vec<String> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut values = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == element.as_bytes() => {
                for attr in e.attributes().flatten() {
                    if attr.key.local_name().as_ref() == attribute.as_bytes() {
                        if let Ok(value) = attr.unescape_value() {
                            values.push(value.into_owned());
                        }
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
    values
}

/// SOAP `Body` 下第一个元素的本地名，例如 `GetProfilesResponse` 或 `Fault`
pub fn body_element(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut in_body = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if in_body => {
                return Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"Body" => in_body = true,
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// `parent` 内第一个 `child` 元素的文本
pub fn nested_text(xml: &str, parent: &str, child: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut level = 0usize;
    let mut parent_at = None;
    let mut want = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                level += 1;
                let name = e.local_name();
                if parent_at.is_none() && name.as_ref() == parent.as_bytes() {
                    parent_at = Some(level);
                } else if parent_at.is_some() && name.as_ref() == child.as_bytes() {
                    want = true;
                }
            }
            Ok(Event::Text(t)) if want => return t.unescape().ok().map(|v| v.into_owned()),
            Ok(Event::End(_)) => {
                if parent_at == Some(level) {
                    parent_at = None;
                }
                level = level.saturating_sub(1);
                want = false;
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// 替换第一个 `<name>..</name>` 的文本（`value` 为原文，写入前转义），元素不存在时返回 `None`
pub fn replace_element_text(xml: &str, name: &str, value: &str) -> Option<String> {
    let value = escape(value);
    let open = format!("<{}>", name);
    let close = format!("</{}>", name);
    let start = xml.find(&open)? + open.len();
    let end = start + xml[start..].find(&close)?;

    let mut patched = String::with_capacity(xml.len() + value.len());
    patched.push_str(&xml[..start]);
    patched.push_str(&value);
    patched.push_str(&xml[end..]);
    Some(patched)
}

/// 在 `after` 之后的第一个 `<name>` 中替换文本（同名元素出现多次时使用）
pub fn replace_element_text_after(xml: &str, after: &str, name: &str, value: &str) -> Option<String> {
    let anchor = xml.find(after)?;
    let patched_tail = replace_element_text(&xml[anchor..], name, value)?;
    Some(format!("{}{}", &xml[..anchor], patched_tail))
}

/// WS-Notification 消息：主题和 `Data` 下的 `SimpleItem` 名值对
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Notification {
    pub topic: String,
    pub data: Vec<(String, String)>,
}

impl Notification {
    pub fn value(&self, name: &str) -> Option<&str> {
        self.data
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

fn simple_item(e: &BytesStart<'_>) -> Option<(String, String)> {
    let mut name = None;
    let mut value = None;
    for attr in e.attributes().flatten() {
        match attr.key.local_name().as_ref() {
            b"Name" => name = attr.unescape_value().ok().map(|v| v.into_owned()),
            b"Value" => value = attr.unescape_value().ok().map(|v| v.into_owned()),
            _ => {}
        }
    }
    Some((name?, value?))
}

/// 解析 `PullMessagesResponse` 中的所有 `NotificationMessage`
pub fn notifications(xml: &str) -> Vec<Notification> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut messages = Vec::new();
    let mut current: Option<Notification> = None;
    let mut in_topic = false;
    let mut in_data = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"NotificationMessage" => current = Some(Notification::default()),
                b"Topic" => in_topic = current.is_some(),
                b"Data" => in_data = current.is_some(),
                b"SimpleItem" if in_data => {
                    if let (Some(message), Some(item)) = (current.as_mut(), simple_item(&e)) {
                        message.data.push(item);
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) if in_data && e.local_name().as_ref() == b"SimpleItem" => {
                if let (Some(message), Some(item)) = (current.as_mut(), simple_item(&e)) {
                    message.data.push(item);
                }
            }
            Ok(Event::Text(t)) if in_topic => {
                if let (Some(message), Ok(text)) = (current.as_mut(), t.unescape()) {
                    message.topic = text.trim().to_string();
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"Topic" => in_topic = false,
                b"Data" => in_data = false,
                b"NotificationMessage" => messages.extend(current.take()),
                _ => {}
            },
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOTION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MotionDetection version="2.0" xmlns="http://www.hikvision.com/ver20/XMLSchema">
<enabled>true</enabled>
<MotionDetectionLayout><sensitivityLevel>60</sensitivityLevel></MotionDetectionLayout>
</MotionDetection>"#;

    #[test]
    fn test_root_and_text() {
        assert_eq!(root_element(MOTION).as_deref(), Some("MotionDetection"));
        assert_eq!(element_text(MOTION, "enabled").as_deref(), Some("true"));
        assert_eq!(element_text(MOTION, "sensitivityLevel").as_deref(), Some("60"));
        assert!(element_text(MOTION, "missing").is_none());
    }

    #[test]
    fn test_namespaced_attributes() {
        let xml = r#"<s:Envelope xmlns:s="x"><s:Body><trt:GetProfilesResponse>
<trt:Profiles token="Profile_1" fixed="true"><tt:Name>main</tt:Name></trt:Profiles>
<trt:Profiles token="Profile_2"><tt:Name>sub</tt:Name></trt:Profiles>
</trt:GetProfilesResponse></s:Body></s:Envelope>"#;
        assert_eq!(attribute_values(xml, "Profiles", "token"), vec!["Profile_1", "Profile_2"]);
        assert_eq!(element_texts(xml, "Name"), vec!["main", "sub"]);
        assert_eq!(root_element(xml).as_deref(), Some("Envelope"));
    }

    #[test]
    fn test_soap_body_and_nested_text() {
        let xml = r#"<s:Envelope xmlns:s="x"><s:Header><a:Action>x</a:Action></s:Header><s:Body>
<tds:GetCapabilitiesResponse><tds:Capabilities>
<tt:Events><tt:XAddr>http://10.0.0.9/onvif/event</tt:XAddr></tt:Events>
<tt:Media><tt:XAddr>http://10.0.0.9/onvif/media</tt:XAddr></tt:Media>
</tds:Capabilities></tds:GetCapabilitiesResponse></s:Body></s:Envelope>"#;
        assert_eq!(body_element(xml).as_deref(), Some("GetCapabilitiesResponse"));
        assert_eq!(
            nested_text(xml, "Media", "XAddr").as_deref(),
            Some("http://10.0.0.9/onvif/media")
        );
        assert!(nested_text(xml, "PTZ", "XAddr").is_none());
    }

    #[test]
    fn test_replace_element_text() {
        let patched = replace_element_text(MOTION, "enabled", "false").unwrap();
        assert!(patched.contains("<enabled>false</enabled>"));
        assert!(patched.contains("<sensitivityLevel>60</sensitivityLevel>"));
        assert!(replace_element_text(MOTION, "nothing", "1").is_none());

        let xml = "<a><id>1</id><enabled>false</enabled></a><b><id>2</id><enabled>false</enabled></b>";
        let patched = replace_element_text_after(xml, "<b>", "enabled", "true").unwrap();
        assert_eq!(
            patched,
            "<a><id>1</id><enabled>false</enabled></a><b><id>2</id><enabled>true</enabled></b>"
        );
    }

    #[test]
    fn test_replaced_text_is_escaped() {
        let xml = "<TextOverlay><id>1</id><displayText>old</displayText></TextOverlay>";
        let patched = replace_element_text(xml, "displayText", "R&D <lab>").unwrap();
        assert_eq!(
            patched,
            "<TextOverlay><id>1</id><displayText>R&amp;D &lt;lab&gt;</displayText></TextOverlay>"
        );
        assert_eq!(root_element(&patched).as_deref(), Some("TextOverlay"));
        assert_eq!(element_text(&patched, "displayText").as_deref(), Some("R&D <lab>"));

        let patched = replace_element_text_after(&patched, "<id>", "displayText", "a\"b").unwrap();
        assert_eq!(element_text(&patched, "displayText").as_deref(), Some("a\"b"));
    }

    #[test]
    fn test_garbled_input_is_tolerated() {
        assert!(root_element("not xml at all").is_none());
        assert!(element_texts("<a><b>1</a>", "b").len() <= 1);
    }

    #[test]
    fn test_notifications() {
        let xml = r#"<s:Envelope xmlns:s="x"><s:Body><tev:PullMessagesResponse>
<tev:CurrentTime>2024-01-01T00:00:00Z</tev:CurrentTime>
<wsnt:NotificationMessage>
  <wsnt:Topic Dialect="http://www.onvif.org/ver10/tev/topicExpression/ConcreteSet">tns1:RuleEngine/CellMotionDetector/Motion</wsnt:Topic>
  <wsnt:Message><tt:Message UtcTime="2024-01-01T00:00:00Z" PropertyOperation="Changed">
    <tt:Source><tt:SimpleItem Name="VideoSourceConfigurationToken" Value="vsc"/></tt:Source>
    <tt:Data><tt:SimpleItem Name="IsMotion" Value="true"/></tt:Data>
  </tt:Message></wsnt:Message>
</wsnt:NotificationMessage>
<wsnt:NotificationMessage>
  <wsnt:Topic>tns1:RuleEngine/LineDetector/Crossed</wsnt:Topic>
  <wsnt:Message><tt:Message><tt:Data><tt:SimpleItem Name="ObjectId" Value="7"></tt:SimpleItem></tt:Data></tt:Message></wsnt:Message>
</wsnt:NotificationMessage>
</tev:PullMessagesResponse></s:Body></s:Envelope>"#;

        let messages = notifications(xml);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].topic, "tns1:RuleEngine/CellMotionDetector/Motion");
        assert_eq!(messages[0].data, vec![("IsMotion".to_string(), "true".to_string())]);
        assert_eq!(messages[1].value("ObjectId"), Some("7"));
        assert!(notifications("<PullMessagesResponse/>").is_empty());
    }
}
