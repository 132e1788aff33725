//! End-to-end tests for the upload pipeline up to (and including) branch
//! synthesis and rebase detection. The forge is not involved; pushes are
//! simulated with remote-tracking refs.

use indexmap::IndexMap;
use lib::git::{NonZeroOid, Repo, Signature, Time};
use lib::testing::{make_git, Git};
use revup_opts::{AutoAddUsers, BranchFormat};
use revup_upload::base_branch::{resolve_branch_tip, BaseBranch};
use revup_upload::rebase_detect::{classify_branch, BranchClassification};
use revup_upload::synthesize::{
    synthesize_branches, Error as SynthesizeError, SynthesisOptions, SynthesizedBranch,
};
use revup_upload::topic_graph::{
    expand_branches, group_topics, TopicGraph, TopicGraphOptions,
};

fn make_graph_options() -> TopicGraphOptions {
    TopicGraphOptions {
        auto_topic: false,
        relative_chain: false,
        self_authored_only: false,
        user_email: "test@example.com".to_owned(),
        uploader: "test".to_owned(),
        branch_format: BranchFormat::UserPlusBranch,
        default_base: "main".to_owned(),
        topic_filter: Vec::new(),
        extra_labels: Vec::new(),
        user_aliases: Vec::new(),
        auto_add_users: AutoAddUsers::No,
        relative_branch: None,
    }
}

fn make_committer() -> Signature {
    Signature {
        name: "Testy McTestface".to_owned(),
        email: "test@example.com".to_owned(),
        time: Time {
            seconds: 1700009999,
            offset_minutes: 0,
        },
    }
}

/// Pin `origin/main` at the current `HEAD`, so subsequent commits form the
/// uploaded range.
fn pin_origin_main(git: &Git) -> eyre::Result<()> {
    git.run(&["update-ref", "refs/remotes/origin/main", "HEAD"])?;
    Ok(())
}

async fn run_pipeline(
    repo: &Repo,
    trim_tags: bool,
) -> eyre::Result<(TopicGraph, Vec<SynthesizedBranch>)> {
    let head = repo.resolve_reference("HEAD").await?.unwrap();
    let base = resolve_branch_tip(repo, "origin", "main").await?;
    let commit_oids = repo.rev_list(head, &[base.tip]).await?;
    let commits = repo.find_commits(&commit_oids).await?;

    let graph_options = make_graph_options();
    let (topics, _warnings) = group_topics(&commits, &graph_options)?;
    let mut base_tips: IndexMap<String, BaseBranch> = IndexMap::new();
    base_tips.insert("main".to_owned(), base);
    let graph = expand_branches(topics, &base_tips, &graph_options)?;
    let synthesized = synthesize_branches(
        repo,
        &graph,
        &make_committer(),
        &SynthesisOptions { trim_tags },
    )
    .await?;
    Ok((graph, synthesized))
}

#[tokio::test]
async fn test_two_independent_topics() -> eyre::Result<()> {
    let git = make_git()?;
    git.init_repo()?;
    pin_origin_main(&git)?;
    let base_tip = git.resolve("HEAD")?;
    git.commit_file_with_contents_and_message("a", 1, "a contents\n", "commit a\n\nTopic: foo")?;
    git.commit_file_with_contents_and_message("b", 2, "b contents\n", "commit b\n\nTopic: bar")?;

    let repo = git.make_repo().await?;
    let (graph, synthesized) = run_pipeline(&repo, false).await?;

    assert_eq!(graph.branches.len(), 2);
    assert_eq!(graph.branches[0].branch_name, "revup/test/main/foo");
    assert_eq!(graph.branches[1].branch_name, "revup/test/main/bar");

    // Both branches sit directly on the base tip.
    for synthesized_branch in &synthesized {
        assert_eq!(synthesized_branch.parent_oid, base_tip);
        assert!(!synthesized_branch.is_empty);
        assert_eq!(synthesized_branch.applied_commits, 1);
    }

    // `bar`'s branch contains b.txt but not a.txt.
    let bar_head = synthesized[1].head_oid;
    let (files, _stderr) = git.run(&[
        "ls-tree",
        "--name-only",
        "-r",
        &bar_head.to_hex(),
    ])?;
    let files: Vec<&str> = files.lines().collect();
    assert!(files.contains(&"b.txt"));
    assert!(!files.contains(&"a.txt"));
    Ok(())
}

#[tokio::test]
async fn test_relative_stack_parents() -> eyre::Result<()> {
    let git = make_git()?;
    git.init_repo()?;
    pin_origin_main(&git)?;
    git.commit_file_with_contents_and_message("a", 1, "a contents\n", "commit a\n\nTopic: foo")?;
    git.commit_file_with_contents_and_message(
        "b",
        2,
        "b contents\n",
        "commit b\n\nTopic: bar\nRelative: foo",
    )?;
    let head = git.resolve("HEAD")?;

    let repo = git.make_repo().await?;
    let (graph, synthesized) = run_pipeline(&repo, false).await?;

    assert_eq!(graph.branches[0].topic_name, "foo");
    assert_eq!(graph.branches[1].topic_name, "bar");
    let foo_head = synthesized[0].head_oid;
    let bar_head = synthesized[1].head_oid;
    assert_eq!(synthesized[1].parent_oid, foo_head);

    // The parent topic's head is an ancestor of the child topic's head, and
    // the child's tree matches the original head's tree.
    assert!(repo.is_ancestor(foo_head, bar_head).await?);
    assert_eq!(
        repo.get_tree_oid(bar_head).await?,
        repo.get_tree_oid(head).await?
    );
    Ok(())
}

#[tokio::test]
async fn test_synthesis_preserves_author_and_message() -> eyre::Result<()> {
    let git = make_git()?;
    git.init_repo()?;
    pin_origin_main(&git)?;
    git.commit_file_with_contents_and_message(
        "a",
        1,
        "a contents\n",
        "commit a\n\nSome body text.\n\nTopic: foo",
    )?;

    let repo = git.make_repo().await?;
    let (_graph, synthesized) = run_pipeline(&repo, false).await?;
    let commit = repo.find_commit(synthesized[0].head_oid).await?;
    assert_eq!(commit.get_author().email, "test@example.com");
    assert_eq!(commit.get_committer().email, "test@example.com");
    assert_eq!(commit.get_summary(), "commit a");
    assert!(commit.get_message().contains("Topic: foo"));

    // With --trim-tags the directive line is stripped but the body remains.
    let (_graph, synthesized) = run_pipeline(&repo, true).await?;
    let commit = repo.find_commit(synthesized[0].head_oid).await?;
    assert_eq!(commit.get_summary(), "commit a");
    assert!(commit.get_message().contains("Some body text."));
    assert!(!commit.get_message().contains("Topic:"));
    Ok(())
}

#[tokio::test]
async fn test_synthesis_is_deterministic() -> eyre::Result<()> {
    let git = make_git()?;
    git.init_repo()?;
    pin_origin_main(&git)?;
    git.commit_file_with_contents_and_message("a", 1, "a contents\n", "commit a\n\nTopic: foo")?;
    git.commit_file_with_contents_and_message(
        "b",
        2,
        "b contents\n",
        "commit b\n\nTopic: bar\nRelative: foo",
    )?;

    let repo = git.make_repo().await?;
    let (_graph, first) = run_pipeline(&repo, false).await?;
    let (_graph, second) = run_pipeline(&repo, false).await?;
    let first_heads: Vec<NonZeroOid> = first.iter().map(|branch| branch.head_oid).collect();
    let second_heads: Vec<NonZeroOid> = second.iter().map(|branch| branch.head_oid).collect();
    assert_eq!(first_heads, second_heads);
    Ok(())
}

#[tokio::test]
async fn test_cherry_pick_conflict_aborts() -> eyre::Result<()> {
    let git = make_git()?;
    git.init_repo()?;
    git.commit_file_with_contents_and_message("shared", 0, "a\n", "base contents")?;
    pin_origin_main(&git)?;
    // `bar` edits the line on top of `foo`'s edit, but is not relative to
    // `foo`, so cherry-picking it onto the base conflicts.
    git.commit_file_with_contents_and_message("shared", 1, "b\n", "commit a\n\nTopic: foo")?;
    git.commit_file_with_contents_and_message("shared", 2, "c\n", "commit b\n\nTopic: bar")?;

    let repo = git.make_repo().await?;
    let result = run_pipeline(&repo, false).await;
    match result {
        Err(report) => {
            let conflict = report.downcast::<SynthesizeError>()?;
            let message = conflict.to_string();
            assert!(message.contains("bar"), "message: {message}");
            assert!(message.contains("shared.txt"), "message: {message}");
        }
        Ok(_) => panic!("expected a cherry-pick conflict"),
    }
    Ok(())
}

#[tokio::test]
async fn test_empty_topic_is_dropped_but_mixed_topic_is_kept() -> eyre::Result<()> {
    let git = make_git()?;
    git.init_repo()?;
    pin_origin_main(&git)?;
    git.commit_empty("empty commit\n\nTopic: emptyonly", 1)?;
    git.commit_file_with_contents_and_message("a", 2, "a contents\n", "commit a\n\nTopic: mixed")?;
    git.commit_empty("another empty\n\nTopic: mixed", 3)?;

    let repo = git.make_repo().await?;
    let (graph, synthesized) = run_pipeline(&repo, false).await?;

    let emptyonly_index = graph.branch_index("emptyonly", "main").unwrap();
    let mixed_index = graph.branch_index("mixed", "main").unwrap();
    assert!(synthesized[emptyonly_index].is_empty);
    assert_eq!(
        synthesized[emptyonly_index].head_oid,
        synthesized[emptyonly_index].parent_oid
    );

    // The mixed topic keeps both commits, including the empty one.
    assert!(!synthesized[mixed_index].is_empty);
    assert_eq!(synthesized[mixed_index].applied_commits, 2);
    Ok(())
}

#[tokio::test]
async fn test_rebase_detection() -> eyre::Result<()> {
    let git = make_git()?;
    git.init_repo()?;
    pin_origin_main(&git)?;
    git.commit_file_with_contents_and_message("a", 1, "a contents\n", "commit a\n\nTopic: foo")?;

    let repo = git.make_repo().await?;
    let (_graph, synthesized) = run_pipeline(&repo, false).await?;
    let first_head = synthesized[0].head_oid;

    // Simulate the push.
    git.run(&[
        "update-ref",
        "refs/remotes/origin/revup/test/main/foo",
        &first_head.to_hex(),
    ])?;

    // Same local state: unchanged.
    let (_graph, synthesized) = run_pipeline(&repo, false).await?;
    assert_eq!(
        classify_branch(
            &repo,
            synthesized[0].head_oid,
            synthesized[0].parent_oid,
            Some(first_head),
            None,
        )
        .await?,
        BranchClassification::Unchanged
    );

    // Advance the base and rebase the stack with no content changes:
    // rebase-only, so no push is needed.
    git.run(&["checkout", "-b", "new-main", "refs/remotes/origin/main"])?;
    git.commit_file("upstream", 4)?;
    git.run(&["update-ref", "refs/remotes/origin/main", "HEAD"])?;
    git.run(&["checkout", "main"])?;
    git.run(&["rebase", "refs/remotes/origin/main"])?;

    let repo = git.make_repo().await?;
    let (_graph, synthesized) = run_pipeline(&repo, false).await?;
    assert_ne!(synthesized[0].head_oid, first_head);
    assert_eq!(
        classify_branch(
            &repo,
            synthesized[0].head_oid,
            synthesized[0].parent_oid,
            Some(first_head),
            None,
        )
        .await?,
        BranchClassification::RebasedOnly
    );

    // Change the commit contents: a push is required.
    git.commit_file_with_contents_and_message(
        "a",
        5,
        "different contents\n",
        "fixup",
    )?;
    git.run(&["reset", "--soft", "HEAD~2"])?;
    git.commit_file_with_contents_and_message(
        "a",
        6,
        "different contents\n",
        "commit a\n\nTopic: foo",
    )?;
    let (_graph, synthesized) = run_pipeline(&repo, false).await?;
    assert_eq!(
        classify_branch(
            &repo,
            synthesized[0].head_oid,
            synthesized[0].parent_oid,
            Some(first_head),
            None,
        )
        .await?,
        BranchClassification::Changed
    );
    Ok(())
}

#[tokio::test]
async fn test_multi_base_topic_produces_two_branches() -> eyre::Result<()> {
    let git = make_git()?;
    git.init_repo()?;
    // The release branch was cut before main advanced, so the two bases
    // differ.
    git.run(&["update-ref", "refs/remotes/origin/rel1.1", "HEAD"])?;
    git.commit_file("base2", 0)?;
    pin_origin_main(&git)?;
    git.commit_file_with_contents_and_message(
        "fix",
        1,
        "fix contents\n",
        "commit fix\n\nTopic: fix\nBranches: main, rel1.1",
    )?;

    let repo = git.make_repo().await?;
    let head = repo.resolve_reference("HEAD").await?.unwrap();
    let base = resolve_branch_tip(&repo, "origin", "main").await?;
    let commit_oids = repo.rev_list(head, &[base.tip]).await?;
    let commits = repo.find_commits(&commit_oids).await?;

    let graph_options = make_graph_options();
    let (topics, _warnings) = group_topics(&commits, &graph_options)?;
    let mut base_tips: IndexMap<String, BaseBranch> = IndexMap::new();
    base_tips.insert("main".to_owned(), base);
    base_tips.insert(
        "rel1.1".to_owned(),
        resolve_branch_tip(&repo, "origin", "rel1.1").await?,
    );
    let graph = expand_branches(topics, &base_tips, &graph_options)?;

    let branch_names: Vec<&str> = graph
        .branches
        .iter()
        .map(|branch| branch.branch_name.as_str())
        .collect();
    assert_eq!(
        branch_names,
        vec!["revup/test/main/fix", "revup/test/rel1.1/fix"]
    );

    let synthesized = synthesize_branches(
        &repo,
        &graph,
        &make_committer(),
        &SynthesisOptions { trim_tags: false },
    )
    .await?;
    assert_eq!(synthesized.len(), 2);
    assert_ne!(synthesized[0].head_oid, synthesized[1].head_oid);
    Ok(())
}
