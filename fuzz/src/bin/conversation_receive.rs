#[macro_use]
extern crate afl;
use otrust::{Conversation, PrivateKey};

fn get_conversation() -> Conversation {
    let key = PrivateKey::generate().expect("Key generation failed");
    Conversation::new(vec![key], None).expect("Setup failed")
}

fn main() {
    let mut conversation = get_conversation();

    fuzz!(|data: &[u8]| {
        let _ = conversation.receive(data);
    });
}
