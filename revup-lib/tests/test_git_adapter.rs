//! Tests for the git adapter: plumbing operations and the transient index.

use revup_lib::git::{MaybeZeroOid, MergedTree, ReferenceName, Signature, Time};
use revup_lib::testing::make_git;

#[tokio::test]
async fn test_resolve_and_rev_list() -> eyre::Result<()> {
    let git = make_git()?;
    git.init_repo()?;
    let first = git.commit_file("one", 1)?;
    let second = git.commit_file("two", 2)?;
    let repo = git.make_repo().await?;

    let head = repo.resolve_reference("HEAD").await?.unwrap();
    assert_eq!(head, second);
    assert_eq!(repo.resolve_reference("no-such-ref").await?, None);

    let initial = git.resolve("HEAD~2")?;
    let walked = repo.rev_list(head, &[initial]).await?;
    assert_eq!(walked, vec![first, second]);

    assert!(repo.is_ancestor(first, second).await?);
    assert!(!repo.is_ancestor(second, first).await?);
    assert_eq!(repo.rev_list_count(initial, second).await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_find_commit_parses_metadata() -> eyre::Result<()> {
    let git = make_git()?;
    git.init_repo()?;
    let oid = git.commit_file_with_contents_and_message(
        "widget",
        1,
        "widget contents\n",
        "Add widget\n\nSome body.\nTopic: widgets",
    )?;
    let repo = git.make_repo().await?;

    let commit = repo.find_commit(oid).await?;
    assert_eq!(commit.get_summary(), "Add widget");
    assert!(commit.get_body().contains("Topic: widgets"));
    assert_eq!(commit.get_author().email, "test@example.com");
    assert_eq!(commit.get_parent_oids().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_for_each_ref_globs() -> eyre::Result<()> {
    let git = make_git()?;
    git.init_repo()?;
    git.run(&["update-ref", "refs/remotes/origin/main", "HEAD"])?;
    git.run(&["update-ref", "refs/remotes/origin/rel1.1", "HEAD"])?;
    git.run(&["update-ref", "refs/remotes/origin/unrelated", "HEAD"])?;
    let repo = git.make_repo().await?;

    let refs = repo
        .for_each_ref(&["refs/remotes/origin/rel*".to_owned()])
        .await?;
    let names: Vec<&str> = refs.iter().map(|(name, _oid)| name.as_str()).collect();
    assert_eq!(names, vec!["refs/remotes/origin/rel1.1"]);
    Ok(())
}

/// Set up a base commit and two child commits (on branches `ours` and
/// `theirs`) editing the shared file.
fn make_three_way(
    git: &revup_lib::testing::Git,
    base_contents: &str,
    ours_contents: &str,
    theirs_contents: &str,
) -> eyre::Result<()> {
    git.commit_file_with_contents_and_message("shared", 1, base_contents, "base")?;
    git.run(&["checkout", "-b", "ours"])?;
    git.commit_file_with_contents_and_message("shared", 2, ours_contents, "ours change")?;
    git.run(&["checkout", "-b", "theirs", "main"])?;
    git.commit_file_with_contents_and_message("shared", 3, theirs_contents, "theirs change")?;
    git.run(&["checkout", "main"])?;
    Ok(())
}

#[tokio::test]
async fn test_transient_index_merges_distinct_hunks() -> eyre::Result<()> {
    let git = make_git()?;
    git.init_repo()?;
    make_three_way(
        &git,
        "one\ntwo\nthree\n",
        "ONE\ntwo\nthree\n",
        "one\ntwo\nTHREE\n",
    )?;
    let repo = git.make_repo().await?;

    let base_tree = repo.get_tree_oid(git.resolve("main")?).await?;
    let ours_tree = repo.get_tree_oid(git.resolve("ours")?).await?;
    let theirs_tree = repo.get_tree_oid(git.resolve("theirs")?).await?;

    let transient_index = repo.transient_index("test");
    let merged = transient_index
        .merge_trees(base_tree, ours_tree, theirs_tree)
        .await?;
    let tree_oid = match merged {
        MergedTree::Clean(tree_oid) => tree_oid,
        MergedTree::Conflicted { conflicting_paths } => {
            panic!("unexpected conflict on {conflicting_paths:?}");
        }
    };

    let (contents, _stderr) = git.run(&["cat-file", "-p", &format!("{tree_oid}:shared.txt")])?;
    assert_eq!(contents, "ONE\ntwo\nTHREE\n");
    Ok(())
}

#[tokio::test]
async fn test_transient_index_reports_conflicts() -> eyre::Result<()> {
    let git = make_git()?;
    git.init_repo()?;
    make_three_way(
        &git,
        "one\ntwo\nthree\n",
        "one\nTWO-A\nthree\n",
        "one\nTWO-B\nthree\n",
    )?;
    let repo = git.make_repo().await?;

    let base_tree = repo.get_tree_oid(git.resolve("main")?).await?;
    let ours_tree = repo.get_tree_oid(git.resolve("ours")?).await?;
    let theirs_tree = repo.get_tree_oid(git.resolve("theirs")?).await?;

    let transient_index = repo.transient_index("test");
    let merged = transient_index
        .merge_trees(base_tree, ours_tree, theirs_tree)
        .await?;
    match merged {
        MergedTree::Conflicted { conflicting_paths } => {
            assert_eq!(
                conflicting_paths,
                vec![std::path::PathBuf::from("shared.txt")]
            );
        }
        MergedTree::Clean(_) => panic!("expected a conflict"),
    }
    Ok(())
}

#[tokio::test]
async fn test_transient_index_never_touches_working_copy() -> eyre::Result<()> {
    let git = make_git()?;
    git.init_repo()?;
    make_three_way(
        &git,
        "one\ntwo\nthree\n",
        "ONE\ntwo\nthree\n",
        "one\ntwo\nTHREE\n",
    )?;
    let repo = git.make_repo().await?;

    let head_before = git.resolve("HEAD")?;
    let (status_before, _stderr) = git.run(&["status", "--porcelain"])?;

    let base_tree = repo.get_tree_oid(git.resolve("main")?).await?;
    let ours_tree = repo.get_tree_oid(git.resolve("ours")?).await?;
    let theirs_tree = repo.get_tree_oid(git.resolve("theirs")?).await?;
    let transient_index = repo.transient_index("test");
    transient_index
        .merge_trees(base_tree, ours_tree, theirs_tree)
        .await?;

    assert_eq!(git.resolve("HEAD")?, head_before);
    let (status_after, _stderr) = git.run(&["status", "--porcelain"])?;
    assert_eq!(status_after, status_before);
    Ok(())
}

#[tokio::test]
async fn test_commit_tree_and_update_ref() -> eyre::Result<()> {
    let git = make_git()?;
    git.init_repo()?;
    let head = git.commit_file("one", 1)?;
    let repo = git.make_repo().await?;

    let tree_oid = repo.get_tree_oid(head).await?;
    let author = Signature {
        name: "Original Author".to_owned(),
        email: "author@example.com".to_owned(),
        time: Time {
            seconds: 1700000100,
            offset_minutes: 0,
        },
    };
    let committer = Signature {
        name: "Uploader".to_owned(),
        email: "uploader@example.com".to_owned(),
        time: Time {
            seconds: 1700000200,
            offset_minutes: -300,
        },
    };
    let new_commit = repo
        .commit_tree(tree_oid, &[head], &author, &committer, "synthesized commit\n")
        .await?;

    let parsed = repo.find_commit(new_commit).await?;
    assert_eq!(parsed.get_author().name, "Original Author");
    assert_eq!(parsed.get_committer().email, "uploader@example.com");
    assert_eq!(parsed.get_committer().time.offset_minutes, -300);
    assert_eq!(parsed.get_summary(), "synthesized commit");
    assert_eq!(parsed.get_parent_oids(), &[head]);

    // Creating the same commit twice is stable.
    let again = repo
        .commit_tree(tree_oid, &[head], &author, &committer, "synthesized commit\n")
        .await?;
    assert_eq!(again, new_commit);

    let reference_name = ReferenceName::new("refs/revup/test-branch");
    repo.update_ref(&reference_name, new_commit, MaybeZeroOid::Zero)
        .await?;
    assert_eq!(
        repo.resolve_reference(reference_name.as_str()).await?,
        Some(new_commit)
    );

    // A stale precondition is rejected.
    let result = repo
        .update_ref(&reference_name, head, MaybeZeroOid::Zero)
        .await;
    assert!(result.is_err());
    Ok(())
}

#[tokio::test]
async fn test_patch_id() -> eyre::Result<()> {
    let git = make_git()?;
    git.init_repo()?;
    let base = git.resolve("HEAD")?;
    let change = git.commit_file("one", 1)?;
    // Rewriting the message preserves the patch.
    git.run(&["commit", "--amend", "-m", "a different message"])?;
    let amended = git.resolve("HEAD")?;
    let repo = git.make_repo().await?;

    let original = repo.get_patch_id(base, change).await?.unwrap();
    let rewritten = repo.get_patch_id(base, amended).await?.unwrap();
    assert_eq!(original, rewritten);

    // An empty commit has no patch id.
    git.commit_empty("empty commit", 2)?;
    let empty = git.resolve("HEAD")?;
    assert_eq!(repo.get_patch_id(amended, empty).await?, None);
    Ok(())
}
