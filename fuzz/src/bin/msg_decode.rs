#[macro_use]
extern crate afl;
use otrust::extract_whitespace_tag;

fn main() {
    fuzz!(|data: &[u8]| {
        let _ = extract_whitespace_tag(data);
    });
}
