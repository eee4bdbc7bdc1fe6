use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0, multispace1, satisfy},
    combinator::{all_consuming, map, map_res, not, opt, peek, recognize, value},
    error::{Error, ErrorKind},
    multi::{many0, separated_list1},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};

use super::ast::*;

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// 关键字后面不能紧跟标识符字符
fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(tag_no_case(kw), not(peek(satisfy(is_ident_char))))
}

const RESERVED: &[&str] = &[
    "SELECT", "FROM", "WHERE", "UPDATE", "SET", "DELETE", "INSERT", "INTO", "VALUES", "AND", "OR",
    "NOT", "IS", "NULL", "TRUE", "FALSE",
];

fn identifier(input: &str) -> IResult<&str, String> {
    let (rest, ident) = recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(input)?;
    if RESERVED.iter().any(|kw| kw.eq_ignore_ascii_case(ident)) {
        return Err(nom::Err::Error(Error::new(input, ErrorKind::Tag)));
    }
    Ok((rest, ident.to_string()))
}

fn int_literal(input: &str) -> IResult<&str, i64> {
    map_res(recognize(pair(opt(char('-')), digit1)), |s: &str| {
        s.parse::<i64>()
    })(input)
}

/// 单引号字符串，`''` 表示一个引号
fn text_literal(input: &str) -> IResult<&str, String> {
    let (mut rest, _) = char('\'')(input)?;
    let mut out = String::new();
    loop {
        let mut chars = rest.chars();
        match chars.next() {
            None => return Err(nom::Err::Error(Error::new(input, ErrorKind::Char))),
            Some('\'') => {
                if chars.as_str().starts_with('\'') {
                    out.push('\'');
                    rest = &rest[2..];
                } else {
                    return Ok((&rest[1..], out));
                }
            }
            Some(c) => {
                out.push(c);
                rest = &rest[c.len_utf8()..];
            }
        }
    }
}

fn literal(input: &str) -> IResult<&str, Literal> {
    alt((
        map(int_literal, Literal::Int),
        map(text_literal, Literal::Text),
        value(Literal::Null, keyword("NULL")),
        value(Literal::Bool(true), keyword("TRUE")),
        value(Literal::Bool(false), keyword("FALSE")),
    ))(input)
}

fn column_ref(input: &str) -> IResult<&str, Expr> {
    let (input, first) = identifier(input)?;
    let (input, second) = opt(preceded(char('.'), identifier))(input)?;
    let expr = match second {
        Some(name) => Expr::Column {
            table: Some(first),
            name,
        },
        None => Expr::Column {
            table: None,
            name: first,
        },
    };
    Ok((input, expr))
}

fn primary(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        delimited(char('('), or_expr, ws(char(')'))),
        map(literal, Expr::Literal),
        column_ref,
    )))(input)
}

fn additive(input: &str) -> IResult<&str, Expr> {
    let (mut input, mut lhs) = primary(input)?;
    loop {
        let op = ws(alt((
            value(BinaryOp::Add, char('+')),
            value(BinaryOp::Sub, char('-')),
        )))(input);
        let (rest, op) = match op {
            Ok(found) => found,
            Err(_) => return Ok((input, lhs)),
        };
        let (rest, rhs) = primary(rest)?;
        lhs = Expr::binary(op, lhs, rhs);
        input = rest;
    }
}

fn null_test(input: &str) -> IResult<&str, Expr> {
    let (input, expr) = additive(input)?;
    let (input, test) = opt(tuple((
        ws(keyword("IS")),
        opt(ws(keyword("NOT"))),
        ws(keyword("NULL")),
    )))(input)?;
    match test {
        Some((_, negated, _)) => Ok((
            input,
            Expr::IsNull {
                expr: Box::new(expr),
                negated: negated.is_some(),
            },
        )),
        None => Ok((input, expr)),
    }
}

fn comparison_op(input: &str) -> IResult<&str, BinaryOp> {
    ws(alt((
        value(BinaryOp::NotEq, tag("<>")),
        value(BinaryOp::NotEq, tag("!=")),
        value(BinaryOp::LtEq, tag("<=")),
        value(BinaryOp::GtEq, tag(">=")),
        value(BinaryOp::Lt, tag("<")),
        value(BinaryOp::Gt, tag(">")),
        value(BinaryOp::Eq, tag("=")),
    )))(input)
}

fn comparison(input: &str) -> IResult<&str, Expr> {
    let (input, lhs) = null_test(input)?;
    let (input, rhs) = opt(pair(comparison_op, null_test))(input)?;
    match rhs {
        Some((op, rhs)) => Ok((input, Expr::binary(op, lhs, rhs))),
        None => Ok((input, lhs)),
    }
}

fn not_expr(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(keyword("NOT")), not_expr), |e| {
            Expr::Not(Box::new(e))
        }),
        comparison,
    ))(input)
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = not_expr(input)?;
    let (input, rest) = many0(preceded(ws(keyword("AND")), not_expr))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |acc, e| Expr::binary(BinaryOp::And, acc, e)),
    ))
}

fn or_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(preceded(ws(keyword("OR")), and_expr))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |acc, e| Expr::binary(BinaryOp::Or, acc, e)),
    ))
}

/// 解析一个独立的表达式
pub fn parse_expr(input: &str) -> Result<Expr, String> {
    match all_consuming(ws(or_expr))(input) {
        Ok((_, expr)) => Ok(expr),
        Err(e) => Err(format!("Parse error: {:?}", e)),
    }
}

fn where_clause(input: &str) -> IResult<&str, Option<Expr>> {
    opt(preceded(ws(keyword("WHERE")), or_expr))(input)
}

fn projection(input: &str) -> IResult<&str, Projection> {
    alt((
        value(Projection::Star, ws(char('*'))),
        map(separated_list1(ws(char(',')), or_expr), Projection::Columns),
    ))(input)
}

fn select_stmt(input: &str) -> IResult<&str, SelectStmt> {
    let (input, _) = ws(keyword("SELECT"))(input)?;
    let (input, projection) = projection(input)?;
    let (input, _) = ws(keyword("FROM"))(input)?;
    let (input, table) = ws(identifier)(input)?;
    let (input, search) = where_clause(input)?;
    Ok((
        input,
        SelectStmt {
            projection,
            table,
            search,
        },
    ))
}

fn set_item(input: &str) -> IResult<&str, (String, Expr)> {
    let (input, name) = ws(identifier)(input)?;
    let (input, _) = ws(char('='))(input)?;
    let (input, value) = or_expr(input)?;
    Ok((input, (name, value)))
}

fn update_stmt(input: &str) -> IResult<&str, UpdateStmt> {
    let (input, _) = ws(keyword("UPDATE"))(input)?;
    let (input, victim) = ws(identifier)(input)?;
    let (input, _) = ws(keyword("SET"))(input)?;
    let (input, set_list) = separated_list1(ws(char(',')), set_item)(input)?;
    let (input, search) = where_clause(input)?;
    Ok((
        input,
        UpdateStmt {
            victim,
            set_list,
            search,
        },
    ))
}

fn delete_stmt(input: &str) -> IResult<&str, DeleteStmt> {
    let (input, _) = ws(keyword("DELETE"))(input)?;
    let (input, _) = ws(keyword("FROM"))(input)?;
    let (input, victim) = ws(identifier)(input)?;
    let (input, search) = where_clause(input)?;
    Ok((input, DeleteStmt { victim, search }))
}

fn value_tuple(input: &str) -> IResult<&str, Vec<Expr>> {
    delimited(
        ws(char('(')),
        separated_list1(ws(char(',')), or_expr),
        ws(char(')')),
    )(input)
}

fn insert_stmt(input: &str) -> IResult<&str, InsertStmt> {
    let (input, _) = ws(keyword("INSERT"))(input)?;
    let (input, _) = ws(keyword("INTO"))(input)?;
    let (input, victim) = ws(identifier)(input)?;
    let (input, _) = ws(keyword("VALUES"))(input)?;
    let (input, values) = separated_list1(ws(char(',')), value_tuple)(input)?;
    Ok((input, InsertStmt { victim, values }))
}

fn txn_kind(input: &str) -> IResult<&str, TxnKind> {
    let (input, kind) = ws(alt((
        value(TxnKind::Begin, keyword("BEGIN")),
        value(
            TxnKind::Begin,
            recognize(tuple((keyword("START"), multispace1, keyword("TRANSACTION")))),
        ),
        value(TxnKind::Commit, keyword("COMMIT")),
        value(TxnKind::Abort, keyword("ROLLBACK")),
        value(TxnKind::Abort, keyword("ABORT")),
    )))(input)?;
    // 允许 BEGIN TRANSACTION / COMMIT WORK 这类后缀
    let (input, _) = take_while(|c: char| c.is_ascii_alphabetic() || c.is_whitespace())(input)?;
    Ok((input, kind))
}

fn statement(input: &str) -> IResult<&str, Statement> {
    let (input, stmt) = alt((
        map(select_stmt, Statement::Select),
        map(update_stmt, Statement::Update),
        map(delete_stmt, Statement::Delete),
        map(insert_stmt, Statement::Insert),
        map(txn_kind, |kind| {
            Statement::Txn(TxnControl {
                kind,
                text: String::new(),
            })
        }),
    ))(input)?;
    let (input, _) = opt(ws(char(';')))(input)?;
    Ok((input, stmt))
}

/// 严格解析一条语句
///
/// 事务控制语句保留原始文本；解析失败返回错误信息。
pub fn parse_statement(input: &str) -> Result<Statement, String> {
    match all_consuming(statement)(input) {
        Ok((_, Statement::Txn(ctl))) => Ok(Statement::Txn(TxnControl {
            kind: ctl.kind,
            text: input.trim().to_string(),
        })),
        Ok((_, stmt)) => Ok(stmt),
        Err(e) => Err(format!("Parse error: {:?}", e)),
    }
}

impl Statement {
    /// 从文本恢复语句
    ///
    /// 只有当规范化输出与原文完全一致时才返回结构化语句，否则保留为不透明文本，
    /// 这样保存再加载的文本逐字节不变。
    pub fn from_sql(text: &str) -> Statement {
        match parse_statement(text) {
            Ok(Statement::Txn(ctl)) if ctl.text == text => Statement::Txn(ctl),
            Ok(Statement::Txn(_)) => Statement::Opaque(text.to_string()),
            Ok(stmt) if stmt.to_string() == text => stmt,
            _ => Statement::Opaque(text.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_select_where() {
        let stmt = parse_statement("SELECT * FROM t_0 WHERE ((t_0.c0 > 3) AND (t_0.c1 IS NOT NULL))")
            .unwrap();
        match stmt {
            Statement::Select(s) => {
                assert_eq!(s.table, "t_0");
                assert_eq!(s.projection, Projection::Star);
                match s.search {
                    Some(Expr::Binary { op, .. }) => assert_eq!(op, BinaryOp::And),
                    other => panic!("unexpected search: {:?}", other),
                }
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn test_parse_update_and_render() {
        let text = "UPDATE t_1 SET wkey = 12, c0 = (c0 + -1) WHERE (t_1.pkey = 4)";
        let stmt = parse_statement(text).unwrap();
        assert_eq!(stmt.to_string(), text);
        assert_eq!(stmt.victim(), Some("t_1"));
    }

    #[test]
    fn test_parse_insert_and_delete() {
        let stmt = parse_statement("insert into t_0 values (1, 2, 'a''b'), (3, 4, NULL);").unwrap();
        match &stmt {
            Statement::Insert(ins) => {
                assert_eq!(ins.values.len(), 2);
                assert_eq!(ins.values[0][2], Expr::text("a'b"));
            }
            other => panic!("unexpected statement: {:?}", other),
        }

        let stmt = parse_statement("DELETE FROM t_0").unwrap();
        assert_eq!(stmt.to_string(), "DELETE FROM t_0");
    }

    #[test]
    fn test_parse_txn_control() {
        let stmt = parse_statement("START TRANSACTION").unwrap();
        assert_eq!(stmt.txn_kind(), Some(TxnKind::Begin));
        assert_eq!(stmt.to_string(), "START TRANSACTION");

        let stmt = parse_statement("ROLLBACK;").unwrap();
        assert_eq!(stmt.txn_kind(), Some(TxnKind::Abort));
        assert!(parse_statement("COMMIT WORK").unwrap().is_commit());
    }

    #[test]
    fn test_from_sql_keeps_unknown_text() {
        let placeholder = Statement::from_sql(SPACE_HOLDER_STMT);
        assert!(placeholder.is_placeholder());

        // 非规范化的写法保留原文
        let loose = Statement::from_sql("select * from t_0");
        assert_eq!(loose, Statement::Opaque("select * from t_0".to_string()));

        let canonical = Statement::from_sql("SELECT * FROM t_0 WHERE (t_0.wkey = 3)");
        assert!(matches!(canonical, Statement::Select(_)));
    }

    #[test]
    fn test_parse_expr_precedence() {
        let expr = parse_expr("a = 1 OR b = 2 AND NOT c = 3").unwrap();
        assert_eq!(expr.to_string(), "((a = 1) OR ((b = 2) AND (NOT (c = 3))))");
    }
}
