use oscard_proto::{Buffer, Tlv};
use oscard_storage::{UserRecord, UserStatus};

const TLV_USER_CLASS: u16 = 0x0001;
const TLV_SIGNON_TIME: u16 = 0x0003;
const TLV_AWAY_FLAG: u16 = 0x0004;

// Free (unconfirmed) account class; every account this server mints.
const USER_CLASS_FREE: u16 = 0x0010;

/// The on-wire user info block shared by self-info replies, buddy
/// arrival notifications and incoming ICBMs: length-prefixed formatted
/// screen name, warning level, then the info TLVs.
pub fn user_info_block(user: &UserRecord) -> Vec<u8> {
    let mut tlvs = vec![
        Tlv::from_u16(TLV_USER_CLASS, USER_CLASS_FREE),
        Tlv::new(
            TLV_SIGNON_TIME,
            (user.last_activity_at.timestamp().max(0) as u32)
                .to_be_bytes()
                .to_vec(),
        ),
    ];
    if user.status == UserStatus::Away {
        tlvs.push(Tlv::new(TLV_AWAY_FLAG, Vec::new()));
    }
    let mut buffer = Buffer::new();
    buffer.write_b8(user.formatted_screen_name.as_bytes());
    buffer.write_u16(0); // warning level
    buffer.write_u16(tlvs.len() as u16);
    for tlv in &tlvs {
        tlv.encode_into(&mut buffer);
    }
    buffer.into_vec()
}

#[cfg(test)]
pub(crate) fn test_user(formatted: &str, status: UserStatus) -> UserRecord {
    use chrono::TimeZone;
    use oscard_proto::canonical_screen_name;
    let moment = chrono::Utc.timestamp_opt(1_100_000_000, 0).unwrap();
    UserRecord {
        screen_name: canonical_screen_name(formatted),
        formatted_screen_name: formatted.to_string(),
        email: String::new(),
        password: "hunter2".to_string(),
        password_hash: String::new(),
        profile: String::new(),
        profile_mime: "text/aolrtf".to_string(),
        away_message: String::new(),
        away_mime: "text/aolrtf".to_string(),
        status,
        verified: false,
        last_activity_at: moment,
        created_at: moment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oscard_proto::{decode_tlvs, find_tlv};

    #[test]
    fn block_layout_parses_back() {
        let user = test_user("Running Man 83", UserStatus::Online);
        let block = user_info_block(&user);
        let mut buffer = Buffer::from_vec(block);
        let name = buffer.read_b8().unwrap();
        assert_eq!(name, b"Running Man 83");
        assert_eq!(buffer.read_u16().unwrap(), 0);
        let count = buffer.read_u16().unwrap() as usize;
        let tlvs = decode_tlvs(&mut buffer).unwrap();
        assert_eq!(tlvs.len(), count);
        assert_eq!(
            find_tlv(&tlvs, TLV_USER_CLASS).unwrap().value_u16().unwrap(),
            USER_CLASS_FREE
        );
        assert!(find_tlv(&tlvs, TLV_SIGNON_TIME).is_some());
        assert!(find_tlv(&tlvs, TLV_AWAY_FLAG).is_none());
    }

    #[test]
    fn away_users_carry_the_away_flag() {
        let user = test_user("alice", UserStatus::Away);
        let mut buffer = Buffer::from_vec(user_info_block(&user));
        buffer.read_b8().unwrap();
        buffer.read_u16().unwrap();
        buffer.read_u16().unwrap();
        let tlvs = decode_tlvs(&mut buffer).unwrap();
        let away = find_tlv(&tlvs, TLV_AWAY_FLAG).unwrap();
        assert!(away.value.is_empty());
    }
}
