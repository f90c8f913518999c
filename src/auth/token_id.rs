use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// 随机数长度（字节）
const NONCE_LEN: usize = 16;

/// 生成 token ID
///
/// hex(HMAC-SHA256(key = uid, clientId || 16 字节系统随机数))，64 位小写十六进制。
pub fn new_token_id(uid: &str, client_id: &str) -> String {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let mut mac =
        HmacSha256::new_from_slice(uid.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(client_id.as_bytes());
    mac.update(&nonce);
    hex::encode(mac.finalize().into_bytes())
}
