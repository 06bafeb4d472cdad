use objspace_rt_abi::{
    create::LifetimeType,
    object::{ObjID, Protections},
};
use sha2::{Digest, Sha256};

#[repr(C)]
struct Ids {
    nonce: u128,
    kuid: ObjID,
    def_prot: Protections,
    lifetime: u32,
    _resv: u64,
}

/// Derive an object ID from a fresh nonce and the object's identity-relevant creation
/// parameters. The 256-bit digest is folded in half.
pub(crate) fn calculate_new_id(
    kuid: ObjID,
    def_prot: Protections,
    lifetime: LifetimeType,
    nonce: u128,
) -> ObjID {
    let ids = Ids {
        nonce,
        kuid,
        def_prot,
        lifetime: lifetime as u32,
        _resv: 0,
    };
    let mut hasher = Sha256::new();
    hasher.update(ids.nonce.to_le_bytes());
    hasher.update(ids.kuid.raw().to_le_bytes());
    hasher.update(ids.def_prot.bits().to_le_bytes());
    hasher.update(ids.lifetime.to_le_bytes());
    hasher.update(ids._resv.to_le_bytes());
    let hash = hasher.finalize();

    let mut id_buf = [0u8; 16];
    id_buf.copy_from_slice(&hash[0..16]);
    for i in 0..16 {
        id_buf[i] ^= hash[i + 16];
    }
    u128::from_le_bytes(id_buf).into()
}

pub(crate) fn gen_id(kuid: ObjID, def_prot: Protections, lifetime: LifetimeType) -> ObjID {
    calculate_new_id(kuid, def_prot, lifetime, rand::random())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_depends_on_nonce_and_params() {
        let prot = Protections::READ;
        let a = calculate_new_id(ObjID::default(), prot, LifetimeType::Volatile, 1);
        let b = calculate_new_id(ObjID::default(), prot, LifetimeType::Volatile, 1);
        let c = calculate_new_id(ObjID::default(), prot, LifetimeType::Volatile, 2);
        let d = calculate_new_id(ObjID::default(), prot, LifetimeType::Persistent, 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn fresh_ids_differ() {
        let a = gen_id(ObjID::default(), Protections::READ, LifetimeType::Volatile);
        let b = gen_id(ObjID::default(), Protections::READ, LifetimeType::Volatile);
        assert_ne!(a, b);
    }
}
