use chrono::{DateTime, Local, Utc};

/// 客户端帧使用的时间格式 / time format carried in client frames
pub const WIRE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 格式化为本地时间字符串 `YYYY-MM-DD HH:MM:SS`
pub fn wire_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format(WIRE_TIME_FORMAT).to_string()
}

pub fn now_wire() -> String {
    wire_time(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_time_shape() {
        let s = now_wire();
        assert_eq!(s.len(), 19);
        assert_eq!(&s[4..5], "-");
        assert_eq!(&s[10..11], " ");
        assert_eq!(&s[13..14], ":");
    }
}
