use hashbrown::HashMap;
use std::sync::OnceLock;

pub const UTF8_GENERAL_CI: u8 = 33;
pub const UTF8_MB4_GENERAL_CI: u8 = 45;
pub const UTF8_MB4_0900_AI_CI: u8 = 255;

pub const DEFAULT_COLLATION_ID: u8 = UTF8_GENERAL_CI;

pub fn collation_names() -> &'static HashMap<&'static str, u8> {
    static COLLATION_NAMES: OnceLock<HashMap<&'static str, u8>> = OnceLock::new();
    COLLATION_NAMES.get_or_init(|| {
        HashMap::from([
            ("big5_chinese_ci", 1),
            ("latin1_swedish_ci", 8),
            ("ascii_general_ci", 11),
            ("utf8_general_ci", UTF8_GENERAL_CI),
            ("utf8mb4_general_ci", UTF8_MB4_GENERAL_CI),
            ("binary", 63),
            ("utf8mb4_0900_ai_ci", UTF8_MB4_0900_AI_CI),
        ])
    })
}
