use std::net::IpAddr;

use hickory_proto::op::Message;
use hickory_proto::rr::{RData, Record, RecordType};
use tracing::debug;

use crate::view::{DefaultRule, View};

/// 一次改写的统计 / Counters from one rewrite pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteStats {
    pub kept: usize,
    pub dropped: usize,
}

/// Address payload of an A/AAAA record. `None` for other types and for address
/// records whose rdata is not the expected address variant.
pub fn answer_addr(record: &Record) -> Option<IpAddr> {
    match record.data() {
        Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
        Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
        _ => None,
    }
}

fn is_address_type(record: &Record) -> bool {
    matches!(record.record_type(), RecordType::A | RecordType::AAAA)
}

/// Keep decision for one answer record against every applicable view.
/// Non-address records and unparseable address payloads are always kept.
pub fn keep_record(record: &Record, views: &[&View], default_rule: DefaultRule) -> bool {
    if !is_address_type(record) {
        return true;
    }
    let Some(addr) = answer_addr(record) else {
        debug!(event = "rewrite_passthrough", name = %record.name(), "address record without address payload");
        return true;
    };
    for view in views {
        if !view.decide(addr, default_rule).is_keep() {
            debug!(event = "rewrite_drop", view = %view.name, addr = %addr, rtype = ?record.record_type(), "view excludes");
            return false;
        }
    }
    debug!(event = "rewrite_keep", addr = %addr, rtype = ?record.record_type(), "views include");
    true
}

/// 按视图过滤 Answer 段 / Filter the answer section in a single forward pass.
/// A record survives only if every view keeps it; order is preserved and
/// the other sections of `msg` are left alone.
pub fn rewrite_answers(msg: &mut Message, views: &[&View], default_rule: DefaultRule) -> RewriteStats {
    if views.is_empty() {
        return RewriteStats {
            kept: msg.answers().len(),
            dropped: 0,
        };
    }
    let answers = msg.take_answers();
    let total = answers.len();
    let kept: Vec<Record> = answers
        .into_iter()
        .filter(|r| keep_record(r, views, default_rule))
        .collect();
    let stats = RewriteStats {
        kept: kept.len(),
        dropped: total - kept.len(),
    };
    msg.insert_answers(kept);
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetList;
    use crate::view::Rule;
    use hickory_proto::op::{MessageType, Query, ResponseCode};
    use hickory_proto::rr::rdata::{A, AAAA, CNAME, TXT};
    use hickory_proto::rr::Name;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::str::FromStr;

    fn name() -> Name {
        Name::from_str("www.example.com.").unwrap()
    }

    fn a(ip: &str) -> Record {
        Record::from_rdata(name(), 300, RData::A(A(Ipv4Addr::from_str(ip).unwrap())))
    }

    fn aaaa(ip: &str) -> Record {
        Record::from_rdata(name(), 300, RData::AAAA(AAAA(Ipv6Addr::from_str(ip).unwrap())))
    }

    fn cname() -> Record {
        Record::from_rdata(
            Name::from_str("alias.example.com.").unwrap(),
            60,
            RData::CNAME(CNAME(name())),
        )
    }

    fn txt() -> Record {
        Record::from_rdata(name(), 60, RData::TXT(TXT::new(vec!["v=1".to_string()])))
    }

    fn response(answers: Vec<Record>) -> Message {
        let mut msg = Message::new();
        msg.set_id(42);
        msg.set_message_type(MessageType::Response);
        msg.set_response_code(ResponseCode::NoError);
        msg.add_query(Query::query(name(), RecordType::A));
        msg.insert_answers(answers);
        msg
    }

    fn view(sources: &[&str], include: &[&str], exclude: &[&str], rule: Rule) -> View {
        View {
            name: "test".to_string(),
            sources: NetList::parse(sources).unwrap(),
            include: NetList::parse(include).unwrap(),
            exclude: NetList::parse(exclude).unwrap(),
            rule,
        }
    }

    fn addrs(msg: &Message) -> Vec<String> {
        msg.answers()
            .iter()
            .map(|r| match answer_addr(r) {
                Some(ip) => ip.to_string(),
                None => r.record_type().to_string(),
            })
            .collect()
    }

    #[test]
    fn internal_view_drops_excluded_private_range() {
        let internal = view(&["10.0.0.0/8"], &[], &["192.168.0.0/16"], Rule::Allow);
        let mut msg = response(vec![a("10.1.1.1"), a("192.168.1.1")]);
        let stats = rewrite_answers(&mut msg, &[&internal], DefaultRule::Deny);
        assert_eq!(addrs(&msg), vec!["10.1.1.1"]);
        assert_eq!(stats, RewriteStats { kept: 1, dropped: 1 });
    }

    #[test]
    fn public_view_keeps_only_included() {
        let public = view(&["0.0.0.0/0"], &["8.8.8.8/32"], &[], Rule::Deny);
        let mut msg = response(vec![a("8.8.8.8"), a("1.1.1.1")]);
        rewrite_answers(&mut msg, &[&public], DefaultRule::Allow);
        assert_eq!(addrs(&msg), vec!["8.8.8.8"]);
    }

    #[test]
    fn order_is_preserved_and_non_address_records_pass() {
        let v = view(&["0.0.0.0/0"], &[], &["10.0.0.0/8", "fd00::/8"], Rule::Allow);
        let original = vec![
            cname(),
            a("10.0.0.1"),
            a("1.2.3.4"),
            txt(),
            aaaa("fd00::1"),
            aaaa("2001:db8::1"),
            a("5.6.7.8"),
        ];
        let mut msg = response(original.clone());
        let stats = rewrite_answers(&mut msg, &[&v], DefaultRule::Deny);
        assert_eq!(stats.dropped, 2);
        let expected: Vec<Record> = vec![
            original[0].clone(),
            original[2].clone(),
            original[3].clone(),
            original[5].clone(),
            original[6].clone(),
        ];
        assert_eq!(msg.answers(), expected.as_slice());
    }

    #[test]
    fn multiple_views_combine_with_and() {
        let drops = view(&["0.0.0.0/0"], &[], &["1.1.1.1"], Rule::Allow);
        let keeps = view(&["0.0.0.0/0"], &["1.1.1.1"], &[], Rule::Allow);
        let mut msg = response(vec![a("1.1.1.1"), a("2.2.2.2")]);
        rewrite_answers(&mut msg, &[&keeps, &drops], DefaultRule::Allow);
        assert_eq!(addrs(&msg), vec!["2.2.2.2"]);

        let mut msg = response(vec![a("1.1.1.1"), a("2.2.2.2")]);
        rewrite_answers(&mut msg, &[&drops, &keeps], DefaultRule::Allow);
        assert_eq!(addrs(&msg), vec!["2.2.2.2"]);
    }

    #[test]
    fn no_views_is_a_no_op() {
        let original = vec![a("10.0.0.1"), cname(), aaaa("::1")];
        let mut msg = response(original.clone());
        let stats = rewrite_answers(&mut msg, &[], DefaultRule::Deny);
        assert_eq!(msg.answers(), original.as_slice());
        assert_eq!(stats, RewriteStats { kept: 3, dropped: 0 });
    }

    #[test]
    fn address_record_without_payload_is_kept() {
        let deny_all = view(&["0.0.0.0/0"], &[], &[], Rule::Deny);
        let mut empty_a = Record::with(name(), RecordType::A, 300);
        empty_a.set_data(None);
        let mut msg = response(vec![empty_a.clone(), a("9.9.9.9")]);
        let stats = rewrite_answers(&mut msg, &[&deny_all], DefaultRule::Deny);
        assert_eq!(msg.answers(), &[empty_a]);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn other_sections_are_untouched() {
        let deny_all = view(&["0.0.0.0/0"], &[], &[], Rule::Deny);
        let mut msg = response(vec![a("9.9.9.9")]);
        msg.add_additional(a("9.9.9.9"));
        msg.add_name_server(a("8.8.8.8"));
        rewrite_answers(&mut msg, &[&deny_all], DefaultRule::Deny);
        assert!(msg.answers().is_empty());
        assert_eq!(msg.additionals().len(), 1);
        assert_eq!(msg.name_servers().len(), 1);
        assert_eq!(msg.queries().len(), 1);
        assert_eq!(msg.id(), 42);
        assert_eq!(msg.response_code(), ResponseCode::NoError);
    }
}
