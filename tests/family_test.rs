use serde_json::json;
use tasksync::family::{FamilyBroadcaster, FamilyDiff};
use tasksync::sync::diff::Patch;

fn diff_for(family_id: &str, instance_id: &str) -> FamilyDiff {
    FamilyDiff {
        family_id: family_id.to_string(),
        instance_id: instance_id.to_string(),
        patch: Patch::new().set("output.text", json!("hi")),
    }
}

#[test]
fn test_topic_is_keyed_by_family() {
    assert_eq!(FamilyBroadcaster::topic("f1"), "taskChange-f1");
}

#[test]
fn test_publish_without_subscribers_is_not_an_error() {
    let family = FamilyBroadcaster::new();
    assert_eq!(family.publish(diff_for("f1", "t1")), 0);
}

#[tokio::test]
async fn test_subscribers_see_only_their_family() {
    let family = FamilyBroadcaster::new();
    let mut f1 = family.subscribe("f1");
    let mut f1_again = family.clone().subscribe("f1");
    let mut f2 = family.subscribe("f2");

    assert_eq!(family.publish(diff_for("f1", "t1")), 2);

    let seen = f1.recv().await.expect("diff delivered");
    assert_eq!(seen, diff_for("f1", "t1"));
    assert!(seen.patch.touches("output.text"));
    assert_eq!(f1_again.recv().await.expect("diff delivered"), seen);
    assert!(f2.try_recv().is_err());
}
