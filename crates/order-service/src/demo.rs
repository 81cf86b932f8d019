//! 演示用的纯字符串变换

pub fn reverse(input: &str) -> String {
    input.chars().rev().collect()
}

pub fn uppercase(input: &str) -> String {
    input.to_uppercase()
}
