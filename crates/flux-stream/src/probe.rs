/// 报警探测进程 stderr 解析结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeSignal {
    Motion(bool),
    Audio(bool),
}

/// 解析 ffmpeg `metadata=print` 与 `silencedetect` 输出
///
/// 场景变化行累计到第五次才报告运动，进度行每次衰减 2，归零时报告运动结束。
#[derive(Debug, Default)]
pub struct AlarmProbeParser {
    motion_count: i32,
    motion_active: bool,
}

const MOTION_TRIGGER_COUNT: i32 = 4;

impl AlarmProbeParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_line(&mut self, line: &str) -> Option<ProbeSignal> {
        if line.contains("lavfi.") {
            if self.motion_count == MOTION_TRIGGER_COUNT {
                self.motion_active = true;
                return Some(ProbeSignal::Motion(true));
            }
            self.motion_count += 1;
            None
        } else if line.contains("speed=") {
            if self.motion_count > 0 {
                self.motion_count -= 2;
                if self.motion_count <= 0 {
                    self.motion_count = 0;
                    if self.motion_active {
                        self.motion_active = false;
                        return Some(ProbeSignal::Motion(false));
                    }
                }
            }
            None
        } else if line.contains("silence_start") {
            Some(ProbeSignal::Audio(false))
        } else if line.contains("silence_end") {
            Some(ProbeSignal::Audio(true))
        } else {
            None
        }
    }

    pub fn motion_active(&self) -> bool {
        self.motion_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENE: &str = "[Parsed_metadata_1 @ 0x55] lavfi.scene_score=0.512";
    const PROGRESS: &str = "frame=  120 fps= 25 q=-0.0 size=N/A time=00:00:04.80 bitrate=N/A speed=1.01x";

    #[test]
    fn test_motion_needs_five_scene_lines() {
        let mut parser = AlarmProbeParser::new();
        for _ in 0..4 {
            assert_eq!(parser.parse_line(SCENE), None);
        }
        assert_eq!(parser.parse_line(SCENE), Some(ProbeSignal::Motion(true)));
        // 继续出现场景行时保持报警
        assert_eq!(parser.parse_line(SCENE), Some(ProbeSignal::Motion(true)));
    }

    #[test]
    fn test_motion_decays_on_progress() {
        let mut parser = AlarmProbeParser::new();
        for _ in 0..5 {
            parser.parse_line(SCENE);
        }
        assert!(parser.motion_active());

        assert_eq!(parser.parse_line(PROGRESS), None);
        assert_eq!(parser.parse_line(PROGRESS), Some(ProbeSignal::Motion(false)));
        assert!(!parser.motion_active());
        assert_eq!(parser.parse_line(PROGRESS), None);
    }

    #[test]
    fn test_noise_below_trigger_is_silent() {
        let mut parser = AlarmProbeParser::new();
        parser.parse_line(SCENE);
        parser.parse_line(SCENE);
        assert_eq!(parser.parse_line(PROGRESS), None);
    }

    #[test]
    fn test_silence_detection() {
        let mut parser = AlarmProbeParser::new();
        assert_eq!(
            parser.parse_line("[silencedetect @ 0x1] silence_start: 12.3"),
            Some(ProbeSignal::Audio(false))
        );
        assert_eq!(
            parser.parse_line("[silencedetect @ 0x1] silence_end: 15.0 | silence_duration: 2.7"),
            Some(ProbeSignal::Audio(true))
        );
        assert_eq!(parser.parse_line("Stream mapping:"), None);
    }
}
